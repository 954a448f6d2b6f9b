//! Graph-based approximate nearest neighbour index stored inside SQLite.
//!
//! Each embedded chunk is a node in `vector_index`: a compressed copy of its
//! vector plus a bounded list of neighbour chunk ids. Queries run a greedy
//! beam search over the compressed vectors, then rerank the survivors with
//! the full-precision embeddings from `chunks`. Node rows cascade with their
//! chunk; a trigger keeps the removed node's neighbour list as a tombstone.
//! [`VectorIndex::repair`] then re-links every node that pointed at a removed
//! one through the removed node's own neighbours, so the graph stays
//! navigable after deletes. Dangling ids met before a repair are skipped.
//!
//! Small indexes (no more nodes than the search list) are scanned exactly.

use anyhow::{Result, bail};
use half::f16;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection};
use std::collections::{HashMap, HashSet};

use super::ChunkId;

/// How distance between two vectors is measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
    Dot,
}

impl DistanceMetric {
    /// Smaller is closer for every metric.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => {
                let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
                for (x, y) in a.iter().zip(b) {
                    dot += x * y;
                    na += x * x;
                    nb += y * y;
                }
                if na == 0.0 || nb == 0.0 {
                    1.0
                } else {
                    1.0 - dot / (na.sqrt() * nb.sqrt())
                }
            }
            Self::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            Self::Dot => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        }
    }

    /// Distance turned into a larger-is-better similarity.
    pub fn similarity(&self, distance: f32) -> f32 {
        match self {
            Self::Cosine => 1.0 - distance,
            Self::L2 => 1.0 / (1.0 + distance),
            Self::Dot => -distance,
        }
    }
}

/// Storage format of the per-node vector copy used during graph traversal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborCompression {
    None,
    #[default]
    Float16,
    /// Symmetric 8-bit quantization with one f32 scale per vector.
    Int8,
}

impl NeighborCompression {
    pub fn compress(&self, vector: &[f32]) -> Vec<u8> {
        match self {
            Self::None => bytemuck::cast_slice::<f32, u8>(vector).to_vec(),
            Self::Float16 => {
                let halves: Vec<f16> = vector.iter().map(|&x| f16::from_f32(x)).collect();
                bytemuck::cast_slice::<f16, u8>(&halves).to_vec()
            }
            Self::Int8 => {
                let max = vector.iter().fold(0.0f32, |m, x| m.max(x.abs()));
                let scale = if max == 0.0 { 1.0 } else { max / 127.0 };
                let mut out = Vec::with_capacity(4 + vector.len());
                out.extend_from_slice(&scale.to_le_bytes());
                out.extend(
                    vector
                        .iter()
                        .map(|x| ((x / scale).round().clamp(-127.0, 127.0) as i8) as u8),
                );
                out
            }
        }
    }

    pub fn decompress(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        match self {
            Self::None => {
                if bytes.len() % 4 != 0 {
                    bail!("f32 vector blob has length {}", bytes.len());
                }
                Ok(bytemuck::pod_collect_to_vec::<u8, f32>(bytes))
            }
            Self::Float16 => {
                if bytes.len() % 2 != 0 {
                    bail!("f16 vector blob has length {}", bytes.len());
                }
                Ok(bytemuck::pod_collect_to_vec::<u8, f16>(bytes)
                    .into_iter()
                    .map(f16::to_f32)
                    .collect())
            }
            Self::Int8 => {
                let Some((scale, values)) = bytes.split_first_chunk::<4>() else {
                    bail!("int8 vector blob is missing its scale");
                };
                let scale = f32::from_le_bytes(*scale);
                Ok(values.iter().map(|&b| (b as i8) as f32 * scale).collect())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorIndexConfig {
    pub metric: DistanceMetric,
    pub compress_neighbors: NeighborCompression,
    /// Out-degree bound of every node.
    pub max_neighbors: usize,
    /// Beam width during search and insertion.
    pub search_list_size: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::Cosine,
            compress_neighbors: NeighborCompression::Float16,
            max_neighbors: 16,
            search_list_size: 64,
        }
    }
}

impl VectorIndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_neighbors == 0 {
            bail!("vector_index.max_neighbors must be at least 1");
        }
        if self.search_list_size < self.max_neighbors {
            bail!("vector_index.search_list_size must be at least max_neighbors");
        }
        Ok(())
    }
}

pub(crate) fn encode_neighbors(ids: &[ChunkId]) -> Vec<u8> {
    bytemuck::cast_slice::<ChunkId, u8>(ids).to_vec()
}

pub(crate) fn decode_neighbors(bytes: &[u8]) -> Vec<ChunkId> {
    if bytes.len() % 8 != 0 {
        return Vec::new();
    }
    bytemuck::pod_collect_to_vec::<u8, ChunkId>(bytes)
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytemuck::pod_collect_to_vec::<u8, f32>(bytes)
}

struct Node {
    vector: Vec<f32>,
    neighbors: Vec<ChunkId>,
}

/// Candidate list ordered by ascending distance.
#[derive(Default)]
struct Beam {
    entries: Vec<(f32, ChunkId)>,
    expanded: HashSet<ChunkId>,
}

impl Beam {
    fn insert(&mut self, distance: f32, id: ChunkId, width: usize) {
        let at = self
            .entries
            .partition_point(|(d, _)| d.total_cmp(&distance).is_le());
        if at < width {
            self.entries.insert(at, (distance, id));
            self.entries.truncate(width);
        }
    }

    fn next_unexpanded(&mut self) -> Option<ChunkId> {
        let id = self
            .entries
            .iter()
            .map(|(_, id)| *id)
            .find(|id| !self.expanded.contains(id))?;
        self.expanded.insert(id);
        Some(id)
    }
}

/// Operations on the `vector_index` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorIndex {
    config: VectorIndexConfig,
}

impl VectorIndex {
    pub fn new(config: VectorIndexConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VectorIndexConfig {
        &self.config
    }

    pub async fn count(&self, conn: &mut SqliteConnection) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_index")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn entry_point(&self, conn: &mut SqliteConnection) -> Result<Option<ChunkId>> {
        let id: Option<ChunkId> =
            sqlx::query_scalar("SELECT chunk_id FROM vector_index ORDER BY chunk_id LIMIT 1")
                .fetch_optional(&mut *conn)
                .await?;
        Ok(id)
    }

    async fn load_nodes(
        &self,
        conn: &mut SqliteConnection,
        ids: &[ChunkId],
    ) -> Result<HashMap<ChunkId, Node>> {
        let mut nodes = HashMap::with_capacity(ids.len());
        // Keep well under SQLite's bound-parameter limit.
        for batch in ids.chunks(500) {
            let placeholders = vec!["?"; batch.len()].join(",");
            let sql = format!(
                "SELECT chunk_id, vector, neighbors FROM vector_index WHERE chunk_id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&mut *conn).await? {
                let id: ChunkId = row.get("chunk_id");
                let vector: Vec<u8> = row.get("vector");
                let neighbors: Vec<u8> = row.get("neighbors");
                nodes.insert(
                    id,
                    Node {
                        vector: self.config.compress_neighbors.decompress(&vector)?,
                        neighbors: decode_neighbors(&neighbors),
                    },
                );
            }
        }
        Ok(nodes)
    }

    async fn load_all_compressed(
        &self,
        conn: &mut SqliteConnection,
    ) -> Result<Vec<(ChunkId, Vec<f32>)>> {
        let rows = sqlx::query("SELECT chunk_id, vector FROM vector_index")
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter()
            .map(|row| {
                let id: ChunkId = row.get("chunk_id");
                let bytes: Vec<u8> = row.get("vector");
                Ok((id, self.config.compress_neighbors.decompress(&bytes)?))
            })
            .collect()
    }

    /// Greedy beam search over compressed vectors. Returns up to `width`
    /// `(distance, id)` pairs, closest first.
    async fn beam_search(
        &self,
        conn: &mut SqliteConnection,
        query: &[f32],
        width: usize,
    ) -> Result<Vec<(f32, ChunkId)>> {
        let Some(entry) = self.entry_point(conn).await? else {
            return Ok(Vec::new());
        };
        let metric = self.config.metric;
        let mut beam = Beam::default();
        let mut visited: HashSet<ChunkId> = HashSet::from([entry]);
        let mut nodes = self.load_nodes(conn, &[entry]).await?;
        if let Some(node) = nodes.get(&entry) {
            beam.insert(metric.distance(query, &node.vector), entry, width);
        }

        while let Some(current) = beam.next_unexpanded() {
            let neighbors = match nodes.get(&current) {
                Some(node) => node.neighbors.clone(),
                None => continue,
            };
            let fresh: Vec<ChunkId> = neighbors
                .into_iter()
                .filter(|id| visited.insert(*id))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            let loaded = self.load_nodes(conn, &fresh).await?;
            // Ids absent from `loaded` belong to deleted chunks.
            for (id, node) in loaded {
                beam.insert(metric.distance(query, &node.vector), id, width);
                nodes.insert(id, node);
            }
        }
        Ok(beam.entries)
    }

    /// Add `chunk_id` to the graph. Must run in the same transaction that
    /// wrote the chunk's embedding.
    pub async fn insert(
        &self,
        conn: &mut SqliteConnection,
        chunk_id: ChunkId,
        vector: &[f32],
    ) -> Result<()> {
        let metric = self.config.metric;
        let max_neighbors = self.config.max_neighbors;
        let compressed = self.config.compress_neighbors.compress(vector);
        let total = self.count(conn).await?;

        let candidates: Vec<(f32, ChunkId)> = if total as usize <= self.config.search_list_size {
            let mut all: Vec<(f32, ChunkId)> = self
                .load_all_compressed(conn)
                .await?
                .into_iter()
                .filter(|(id, _)| *id != chunk_id)
                .map(|(id, v)| (metric.distance(vector, &v), id))
                .collect();
            all.sort_by(|a, b| a.0.total_cmp(&b.0));
            all
        } else {
            self.beam_search(conn, vector, self.config.search_list_size)
                .await?
                .into_iter()
                .filter(|(_, id)| *id != chunk_id)
                .collect()
        };
        let neighbors: Vec<ChunkId> = candidates
            .iter()
            .take(max_neighbors)
            .map(|(_, id)| *id)
            .collect();

        sqlx::query(
            r#"
            INSERT INTO vector_index (chunk_id, vector, neighbors) VALUES (?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET vector = excluded.vector, neighbors = excluded.neighbors
            "#,
        )
        .bind(chunk_id)
        .bind(&compressed)
        .bind(encode_neighbors(&neighbors))
        .execute(&mut *conn)
        .await?;

        // Back-links, pruned to the closest `max_neighbors` of each neighbour.
        let stored = self.config.compress_neighbors.decompress(&compressed)?;
        let linked = self.load_nodes(conn, &neighbors).await?;
        for (neighbor_id, node) in linked {
            let mut list: Vec<ChunkId> = node
                .neighbors
                .iter()
                .copied()
                .filter(|id| *id != chunk_id)
                .collect();
            list.push(chunk_id);

            if list.len() > max_neighbors {
                let others: Vec<ChunkId> =
                    list.iter().copied().filter(|id| *id != chunk_id).collect();
                let mut vectors = self.load_nodes(conn, &others).await?;
                let mut scored: Vec<(f32, ChunkId)> = Vec::with_capacity(list.len());
                scored.push((metric.distance(&node.vector, &stored), chunk_id));
                for id in others {
                    if let Some(other) = vectors.remove(&id) {
                        scored.push((metric.distance(&node.vector, &other.vector), id));
                    }
                }
                scored.sort_by(|a, b| a.0.total_cmp(&b.0));
                list = scored
                    .into_iter()
                    .take(max_neighbors)
                    .map(|(_, id)| id)
                    .collect();
            }

            sqlx::query("UPDATE vector_index SET neighbors = ? WHERE chunk_id = ?")
                .bind(encode_neighbors(&list))
                .bind(neighbor_id)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Re-link the graph around nodes removed since the last repair and clear
    /// their tombstones. Returns the number of nodes whose links changed.
    pub async fn repair(&self, conn: &mut SqliteConnection) -> Result<usize> {
        let tombstones: HashMap<ChunkId, Vec<ChunkId>> =
            sqlx::query("SELECT chunk_id, neighbors FROM vector_index_tombstones")
                .fetch_all(&mut *conn)
                .await?
                .into_iter()
                .map(|row| {
                    let bytes: Vec<u8> = row.get("neighbors");
                    (row.get("chunk_id"), decode_neighbors(&bytes))
                })
                .collect();
        if tombstones.is_empty() {
            return Ok(0);
        }

        let affected: Vec<(ChunkId, Vec<ChunkId>)> =
            sqlx::query("SELECT chunk_id, neighbors FROM vector_index")
                .fetch_all(&mut *conn)
                .await?
                .into_iter()
                .filter_map(|row| {
                    let id: ChunkId = row.get("chunk_id");
                    let bytes: Vec<u8> = row.get("neighbors");
                    let neighbors = decode_neighbors(&bytes);
                    neighbors
                        .iter()
                        .any(|n| tombstones.contains_key(n))
                        .then_some((id, neighbors))
                })
                .collect();

        let metric = self.config.metric;
        let max_neighbors = self.config.max_neighbors;
        for (id, neighbors) in &affected {
            // Surviving links plus whatever the removed neighbours linked to,
            // following chains of removed nodes.
            let mut candidates: HashSet<ChunkId> = HashSet::new();
            let mut seen: HashSet<ChunkId> = HashSet::new();
            let mut pending: Vec<ChunkId> = neighbors.clone();
            while let Some(next) = pending.pop() {
                if next == *id || !seen.insert(next) {
                    continue;
                }
                match tombstones.get(&next) {
                    Some(links) => pending.extend(links.iter().copied()),
                    None => {
                        candidates.insert(next);
                    }
                }
            }

            let mut ids: Vec<ChunkId> = candidates.into_iter().collect();
            ids.push(*id);
            let mut nodes = self.load_nodes(conn, &ids).await?;
            let Some(node) = nodes.remove(id) else {
                continue;
            };
            let mut scored: Vec<(f32, ChunkId)> = nodes
                .iter()
                .map(|(other, n)| (metric.distance(&node.vector, &n.vector), *other))
                .collect();
            scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            let list: Vec<ChunkId> = scored
                .into_iter()
                .take(max_neighbors)
                .map(|(_, other)| other)
                .collect();
            sqlx::query("UPDATE vector_index SET neighbors = ? WHERE chunk_id = ?")
                .bind(encode_neighbors(&list))
                .bind(*id)
                .execute(&mut *conn)
                .await?;
        }

        sqlx::query("DELETE FROM vector_index_tombstones")
            .execute(&mut *conn)
            .await?;
        tracing::debug!(
            removed = tombstones.len(),
            relinked = affected.len(),
            "Repaired vector index"
        );
        Ok(affected.len())
    }

    /// Up to `limit` `(chunk_id, distance)` pairs nearest to `query`, ranked
    /// by full-precision distance.
    pub async fn search(
        &self,
        conn: &mut SqliteConnection,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(ChunkId, f32)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let width = self.config.search_list_size.max(limit);
        let total = self.count(conn).await?;

        let candidate_ids: Option<Vec<ChunkId>> = if total as usize <= width {
            None
        } else {
            Some(
                self.beam_search(conn, query, width)
                    .await?
                    .into_iter()
                    .map(|(_, id)| id)
                    .collect(),
            )
        };

        let embeddings = self.full_embeddings(conn, candidate_ids.as_deref()).await?;
        let metric = self.config.metric;
        let mut ranked: Vec<(ChunkId, f32)> = embeddings
            .into_iter()
            .filter(|(_, v)| v.len() == query.len())
            .map(|(id, v)| (id, metric.distance(query, &v)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Full-precision embeddings of indexed chunks; every node when `ids` is `None`.
    async fn full_embeddings(
        &self,
        conn: &mut SqliteConnection,
        ids: Option<&[ChunkId]>,
    ) -> Result<Vec<(ChunkId, Vec<f32>)>> {
        let rows = match ids {
            None => {
                sqlx::query(
                    "SELECT c.id, c.embedding FROM vector_index v JOIN chunks c ON c.id = v.chunk_id WHERE c.embedding IS NOT NULL",
                )
                .fetch_all(&mut *conn)
                .await?
            }
            Some([]) => Vec::new(),
            Some(ids) => {
                let placeholders = vec!["?"; ids.len()].join(",");
                let sql = format!(
                    "SELECT id, embedding FROM chunks WHERE embedding IS NOT NULL AND id IN ({placeholders})"
                );
                let mut query = sqlx::query(&sql);
                for id in ids {
                    query = query.bind(id);
                }
                query.fetch_all(&mut *conn).await?
            }
        };
        Ok(rows
            .into_iter()
            .map(|row| {
                let id: ChunkId = row.get(0);
                let bytes: Vec<u8> = row.get(1);
                (id, decode_embedding(&bytes))
            })
            .collect())
    }

    /// Drop the graph and re-insert every embedded chunk in id order.
    pub async fn rebuild(&self, conn: &mut SqliteConnection) -> Result<usize> {
        sqlx::query("DELETE FROM vector_index")
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM vector_index_tombstones")
            .execute(&mut *conn)
            .await?;
        let rows = sqlx::query("SELECT id, embedding FROM chunks WHERE embedding IS NOT NULL ORDER BY id")
            .fetch_all(&mut *conn)
            .await?;
        let total = rows.len();
        for row in rows {
            let id: ChunkId = row.get("id");
            let bytes: Vec<u8> = row.get("embedding");
            self.insert(conn, id, &decode_embedding(&bytes)).await?;
        }
        tracing::info!(nodes = total, "Rebuilt vector index");
        Ok(total)
    }
}
