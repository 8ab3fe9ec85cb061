use clap::Parser;
use quarry_context::text::{Chunk, Chunker, ChunkingConfig, DEFAULT_BOUNDARY_DELIMITERS};
use std::fs;
use std::io::{self, Read};
use std::process;

/// Chunk a text file the way `quarry ingest` does and print the chunks as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Source identifier recorded on every chunk.
    /// Defaults to the input path, or "stdin".
    #[arg(short, long)]
    source_id: Option<String>,

    /// Maximum number of characters in a chunk.
    #[arg(short, long, default_value_t = ChunkingConfig::default().max_chars)]
    max_chars: usize,

    /// Number of characters shared by consecutive chunks.
    #[arg(short, long, default_value_t = ChunkingConfig::default().overlap_chars)]
    overlap_chars: usize,

    /// How far back from a tentative cut to look for a delimiter.
    #[arg(short, long)]
    boundary_window: Option<usize>,

    /// Comma-separated list of regex patterns for boundary delimiters,
    /// most significant first. Defaults to sentence end, newline, whitespace.
    #[arg(short, long, value_delimiter = ',')]
    delimiters: Option<Vec<String>>,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let file_content = if let Some(input_path) = &args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };
    let source_id = args
        .source_id
        .or(args.input)
        .unwrap_or_else(|| "stdin".to_string());

    let config = ChunkingConfig {
        max_chars: args.max_chars,
        overlap_chars: args.overlap_chars,
        boundary_window: args.boundary_window,
    };

    let chunker = match &args.delimiters {
        Some(patterns) => {
            let refs: Vec<&str> = patterns.iter().map(String::as_str).collect();
            Chunker::with_delimiters(config, &refs)?
        }
        None => Chunker::with_delimiters(config, DEFAULT_BOUNDARY_DELIMITERS)?,
    };

    let chunks: Vec<Chunk> = chunker.chunk(&source_id, &file_content).collect();
    println!("{}", serde_json::to_string_pretty(&chunks)?);

    Ok(())
}
