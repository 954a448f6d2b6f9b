//! Keyword, semantic and hybrid search against [`SqliteStore`].

use super::sqlite_store::SqliteStore;
use super::vector_index::DistanceMetric;
use super::{
    ChunkId, HybridWeights, MatchType, SearchBackend, SearchFilters, SearchHit, parse_timestamp,
};
use anyhow::Result;
use async_trait::async_trait;
use itertools::Itertools;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::collections::HashMap;

const HIT_COLUMNS: &str = "c.id AS chunk_id, c.document_id, c.chunk_index, c.text, c.section, c.page, \
     d.file_path, d.file_name, d.indexed_at";

enum Bind {
    Text(String),
    Int(i64),
}

/// SQL conditions (each starting with ` AND`) and their bind values.
fn filter_sql(filters: &SearchFilters) -> (String, Vec<Bind>) {
    let mut sql = String::new();
    let mut binds = Vec::new();
    if !filters.file_types.is_empty() {
        let placeholders = vec!["?"; filters.file_types.len()].join(",");
        sql.push_str(&format!(" AND lower(d.file_extension) IN ({placeholders})"));
        binds.extend(
            filters
                .file_types
                .iter()
                .map(|t| Bind::Text(t.trim_start_matches('.').to_lowercase())),
        );
    }
    if let Some(prefix) = &filters.path_prefix {
        sql.push_str(" AND substr(d.file_path, 1, length(?)) = ?");
        binds.push(Bind::Text(prefix.clone()));
        binds.push(Bind::Text(prefix.clone()));
    }
    for tag in &filters.tags {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM document_tags dt JOIN tags t ON t.id = dt.tag_id \
             WHERE dt.document_id = d.id AND t.name = ?)",
        );
        binds.push(Bind::Text(tag.clone()));
    }
    if !filters.document_ids.is_empty() {
        let placeholders = vec!["?"; filters.document_ids.len()].join(",");
        sql.push_str(&format!(" AND d.id IN ({placeholders})"));
        binds.extend(filters.document_ids.iter().map(|id| Bind::Int(*id)));
    }
    (sql, binds)
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [Bind],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Text(s) => query.bind(s.as_str()),
            Bind::Int(i) => query.bind(*i),
        };
    }
    query
}

fn hit_from_row(row: &SqliteRow, match_type: MatchType) -> SearchHit {
    let indexed_at: Option<String> = row.get("indexed_at");
    SearchHit {
        chunk_id: row.get("chunk_id"),
        document_id: row.get("document_id"),
        file_path: row.get("file_path"),
        file_name: row.get("file_name"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        section: row.get("section"),
        page: row.get("page"),
        score: 0.0,
        keyword_score: None,
        vector_score: None,
        snippet: None,
        match_type,
        indexed_at: indexed_at.as_deref().map(parse_timestamp),
    }
}

/// Min-max normalise into `[0, 1]`; a single distinct value maps to 1.
fn normalize(values: &[f32]) -> Vec<f32> {
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });
    if values.is_empty() || (max - min).abs() < f32::EPSILON {
        return vec![1.0; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min)).collect()
}

/// Similarities mapped into `[0, 1]` for hybrid weighting.
fn vector_scores(metric: DistanceMetric, similarities: &[f32]) -> Vec<f32> {
    match metric {
        DistanceMetric::Cosine | DistanceMetric::L2 => {
            similarities.iter().map(|s| s.clamp(0.0, 1.0)).collect()
        }
        DistanceMetric::Dot => normalize(similarities),
    }
}

/// Best score first; ties go to the most recently indexed document.
fn rank(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.indexed_at.cmp(&a.indexed_at))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

impl SqliteStore {
    async fn hits_for_chunks(
        &self,
        ids: &[ChunkId],
        filters: &SearchFilters,
    ) -> Result<HashMap<ChunkId, SearchHit>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let (filter, binds) = filter_sql(filters);
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT {HIT_COLUMNS} FROM chunks c JOIN documents d ON d.id = c.document_id \
             WHERE c.id IN ({placeholders}){filter}"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = bind_all(query, &binds).fetch_all(self.pool()).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let hit = hit_from_row(row, MatchType::Semantic);
                (hit.chunk_id, hit)
            })
            .collect())
    }
}

#[async_trait]
impl SearchBackend for SqliteStore {
    async fn search_keyword(
        &self,
        fts_query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        if fts_query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let (filter, binds) = filter_sql(filters);
        let sql = format!(
            "SELECT {HIT_COLUMNS}, bm25(chunks_fts) AS rank, \
             snippet(chunks_fts, 0, '<mark>', '</mark>', '…', 16) AS snippet \
             FROM chunks_fts \
             JOIN chunks c ON c.id = chunks_fts.rowid \
             JOIN documents d ON d.id = c.document_id \
             WHERE chunks_fts MATCH ?{filter} \
             ORDER BY rank LIMIT ?"
        );
        let query = sqlx::query(&sql).bind(fts_query);
        let rows = bind_all(query, &binds)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;

        // bm25 is lower-is-better.
        let raw: Vec<f32> = rows
            .iter()
            .map(|row| -(row.get::<f64, _>("rank") as f32))
            .collect();
        let scores = normalize(&raw);
        let mut hits: Vec<SearchHit> = rows
            .iter()
            .zip(scores)
            .map(|(row, score)| {
                let mut hit = hit_from_row(row, MatchType::Keyword);
                hit.score = score;
                hit.keyword_score = Some(score);
                hit.snippet = row.get("snippet");
                hit
            })
            .collect();
        rank(&mut hits);
        Ok(hits)
    }

    async fn search_semantic(
        &self,
        vector: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        // Filters are applied after the graph search, so look further.
        let wanted = if filters.is_empty() {
            limit
        } else {
            (limit * 4).max(self.vector_index().config().search_list_size)
        };
        let neighbors = {
            let mut conn = self.pool().acquire().await?;
            self.vector_index().search(&mut conn, vector, wanted).await?
        };
        let ids: Vec<ChunkId> = neighbors.iter().map(|(id, _)| *id).collect();
        let mut rows = self.hits_for_chunks(&ids, filters).await?;

        let metric = self.vector_index().config().metric;
        let hits = neighbors
            .into_iter()
            .filter_map(|(id, distance)| {
                let mut hit = rows.remove(&id)?;
                let similarity = metric.similarity(distance);
                hit.score = similarity;
                hit.vector_score = Some(similarity);
                Some(hit)
            })
            .take(limit)
            .collect();
        Ok(hits)
    }

    async fn search_hybrid(
        &self,
        fts_query: &str,
        vector: &[f32],
        weights: HybridWeights,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let pool_size = limit.saturating_mul(2).max(limit);
        let keyword = self.search_keyword(fts_query, filters, pool_size).await?;
        let semantic = self.search_semantic(vector, filters, pool_size).await?;

        let metric = self.vector_index().config().metric;
        let similarities: Vec<f32> = semantic.iter().map(|h| h.score).collect();
        let normalized = vector_scores(metric, &similarities);

        let mut merged: HashMap<ChunkId, SearchHit> = HashMap::new();
        for hit in keyword {
            merged.insert(hit.chunk_id, hit);
        }
        for (hit, score) in semantic.into_iter().zip(normalized) {
            merged
                .entry(hit.chunk_id)
                .and_modify(|existing| {
                    existing.vector_score = Some(score);
                    existing.match_type = MatchType::Hybrid;
                })
                .or_insert_with(|| SearchHit {
                    vector_score: Some(score),
                    ..hit
                });
        }

        let mut hits = merged
            .into_values()
            .map(|mut hit| {
                hit.score = weights.keyword * hit.keyword_score.unwrap_or(0.0)
                    + weights.semantic * hit.vector_score.unwrap_or(0.0);
                hit
            })
            .collect_vec();
        rank(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DocumentStatus, NewChunk, NewDocument, VectorIndexConfig};

    async fn seeded() -> Result<SqliteStore> {
        let store = SqliteStore::open_memory(Some(2), VectorIndexConfig::default()).await?;
        let docs = [
            ("/w/notes/rust.md", "md", "rust ownership and borrowing", [1.0, 0.0]),
            ("/w/notes/cooking.txt", "txt", "slow cooked tomato sauce", [0.0, 1.0]),
            ("/w/src/lib.rs", "rs", "borrowing rules in rust code", [0.9, 0.1]),
        ];
        for (path, ext, text, vector) in docs {
            let id = store
                .upsert_document(&NewDocument {
                    file_path: path.to_string(),
                    file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
                    file_extension: Some(ext.to_string()),
                    file_hash: "h".to_string(),
                    ..Default::default()
                })
                .await?;
            store
                .replace_chunks(
                    id,
                    &[NewChunk {
                        chunk_index: 0,
                        text: text.to_string(),
                        embedding: Some(vector.to_vec()),
                        end_offset: text.len() as i64,
                        ..Default::default()
                    }],
                )
                .await?;
            store.set_document_status(id, DocumentStatus::Indexed).await?;
        }
        Ok(store)
    }

    #[tokio::test]
    async fn test_keyword_search_scores_and_snippets() -> Result<()> {
        let store = seeded().await?;
        let hits = store
            .search_keyword("borrowing", &SearchFilters::default(), 10)
            .await?;
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
        assert!(hits[0].score >= hits[1].score);
        assert!(hits[0].snippet.as_deref().unwrap_or("").contains("<mark>borrowing</mark>"));

        let single = store
            .search_keyword("tomato", &SearchFilters::default(), 10)
            .await?;
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].score, 1.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_filters_restrict_results() -> Result<()> {
        let store = seeded().await?;
        let by_type = SearchFilters {
            file_types: vec![".RS".to_string()],
            ..Default::default()
        };
        let hits = store.search_keyword("borrowing", &by_type, 10).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "/w/src/lib.rs");

        let by_prefix = SearchFilters {
            path_prefix: Some("/w/notes/".to_string()),
            ..Default::default()
        };
        let hits = store.search_semantic(&[1.0, 0.0], &by_prefix, 10).await?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].file_path, "/w/notes/rust.md");

        let doc = store.get_document_by_path("/w/notes/cooking.txt").await?.unwrap();
        store.add_tag(doc.id, "kitchen").await?;
        let by_tag = SearchFilters {
            tags: vec!["kitchen".to_string()],
            ..Default::default()
        };
        let hits = store.search_semantic(&[1.0, 0.0], &by_tag, 10).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, doc.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_semantic_ranks_by_similarity() -> Result<()> {
        let store = seeded().await?;
        let hits = store
            .search_semantic(&[1.0, 0.0], &SearchFilters::default(), 2)
            .await?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].file_path, "/w/notes/rust.md");
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert_eq!(hits[1].file_path, "/w/src/lib.rs");
        Ok(())
    }

    #[tokio::test]
    async fn test_hybrid_merges_both_signals() -> Result<()> {
        let store = seeded().await?;
        let hits = store
            .search_hybrid(
                "borrowing",
                &[0.0, 1.0],
                HybridWeights::default(),
                &SearchFilters::default(),
                3,
            )
            .await?;
        assert_eq!(hits.len(), 3);
        let cooking = hits
            .iter()
            .find(|h| h.file_path.ends_with("cooking.txt"))
            .unwrap();
        assert_eq!(cooking.match_type, MatchType::Semantic);
        assert!(hits.iter().any(|h| h.match_type == MatchType::Hybrid));
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        Ok(())
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(&[2.0, 4.0, 3.0]), vec![0.0, 1.0, 0.5]);
        assert_eq!(normalize(&[5.0]), vec![1.0]);
        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn test_rank_breaks_ties_by_recency() {
        let base = SearchHit {
            chunk_id: 1,
            document_id: 1,
            file_path: String::new(),
            file_name: String::new(),
            chunk_index: 0,
            text: String::new(),
            section: None,
            page: None,
            score: 0.5,
            keyword_score: None,
            vector_score: None,
            snippet: None,
            match_type: MatchType::Keyword,
            indexed_at: Some(parse_timestamp("2024-01-01T00:00:00Z")),
        };
        let newer = SearchHit {
            chunk_id: 2,
            indexed_at: Some(parse_timestamp("2024-06-01T00:00:00Z")),
            ..base.clone()
        };
        let mut hits = vec![base, newer];
        rank(&mut hits);
        assert_eq!(hits[0].chunk_id, 2);
    }
}
