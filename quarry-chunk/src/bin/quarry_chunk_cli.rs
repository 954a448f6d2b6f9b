use clap::Parser;
use quarry_chunk::{ChunkOptions, Chunker, RecursiveChunker, delimiters_for_path};
use std::fs;
use std::io::{self, Read};
use std::path::Path;

/// Chunk a text file (or stdin) and print the chunks as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Maximum length for each chunk, in characters.
    #[arg(short, long, default_value_t = 1000)]
    max_chunk_size: usize,

    /// Characters of overlap between consecutive chunks.
    #[arg(short = 'o', long, default_value_t = 200)]
    chunk_overlap: usize,

    /// Comma-separated list of regex patterns for delimiters.
    /// Defaults to patterns chosen from the input file extension.
    #[arg(short, long, value_delimiter = ',')]
    delimiters: Option<Vec<String>>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_content = if let Some(input_path) = &args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let chunker = match &args.delimiters {
        Some(patterns) => {
            let refs: Vec<&str> = patterns.iter().map(|s| s.as_str()).collect();
            RecursiveChunker::with_delimiters("cli", &refs)?
        }
        None => {
            let path = args.input.as_deref().unwrap_or("stdin.txt");
            RecursiveChunker::with_delimiters("cli", delimiters_for_path(Path::new(path)))?
        }
    };

    let options = ChunkOptions::new(args.max_chunk_size, args.chunk_overlap);
    let chunks = chunker.chunk(&file_content, &options)?;
    println!("{}", serde_json::to_string_pretty(&chunks)?);

    Ok(())
}
