//! Local markdown corpus retriever.
//!
//! Loads every `.md` file under a directory, splits it into overlapping
//! chunks and ranks chunks by accent- and case-folded term overlap with the
//! query.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    retrieval::{Retriever, Snippet, source_name},
};

/// Chunking parameters
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Target chunk size in bytes
    pub size: usize,
    /// Bytes shared between consecutive chunks
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: 1000,
            overlap: 200,
        }
    }
}

/// Preferred split points, strongest first
const SEPARATORS: &[&str] = &["\n# ", "\n## ", "\n### ", "\n\n", "\n", " "];

/// Terms shorter than this carry no signal
const MIN_TERM_LEN: usize = 3;

struct Chunk {
    text: String,
    source: String,
    terms: HashSet<String>,
}

/// In-memory lexical retriever over a markdown directory
pub struct CorpusRetriever {
    chunks: Vec<Chunk>,
}

impl CorpusRetriever {
    /// Load and chunk every markdown file under `dir`
    pub fn load(dir: &Path, config: &ChunkConfig) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Retrieval(format!(
                "corpus directory {} does not exist",
                dir.display()
            )));
        }
        let pattern = format!("{}/**/*.md", dir.display());
        let paths = glob::glob(&pattern).map_err(|e| Error::Retrieval(e.to_string()))?;

        let mut documents: Vec<(PathBuf, String)> = Vec::new();
        for entry in paths {
            match entry {
                Ok(path) => {
                    let text = std::fs::read_to_string(&path)?;
                    documents.push((path, text));
                }
                Err(e) => tracing::warn!(error = %e, "skipping unreadable corpus entry"),
            }
        }
        documents.sort_by(|a, b| a.0.cmp(&b.0));

        let retriever = Self::from_documents(
            documents
                .iter()
                .map(|(path, text)| (path.to_string_lossy().into_owned(), text.as_str())),
            config,
        );
        tracing::info!(
            dir = %dir.display(),
            files = documents.len(),
            chunks = retriever.len(),
            "loaded corpus"
        );
        Ok(retriever)
    }

    /// Build from `(source, text)` pairs
    pub fn from_documents<'a>(
        documents: impl IntoIterator<Item = (String, &'a str)>,
        config: &ChunkConfig,
    ) -> Self {
        let mut chunks = Vec::new();
        for (source, text) in documents {
            let source = source_name(&source);
            for piece in split_text(text, config) {
                chunks.push(Chunk {
                    terms: terms(&piece),
                    text: piece,
                    source: source.clone(),
                });
            }
        }
        Self { chunks }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn search(&self, query: &str, k: usize) -> Vec<Snippet> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(usize, usize)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| (i, query_terms.intersection(&chunk.terms).count()))
            .filter(|(_, score)| *score > 0)
            .collect();
        // Stable sort keeps corpus order among equal scores
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored
            .into_iter()
            .take(k)
            .map(|(i, _)| Snippet::new(self.chunks[i].text.clone(), self.chunks[i].source.clone()))
            .collect()
    }
}

#[async_trait]
impl Retriever for CorpusRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Snippet>> {
        Ok(self.search(query, k))
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Split text into chunks of at most `size` bytes, cutting at the strongest
/// separator found in the back half of each window.
pub fn split_text(text: &str, config: &ChunkConfig) -> Vec<String> {
    let size = config.size.max(1);
    let overlap = config.overlap.min(size / 2);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = floor_char_boundary(text, start + size);
        if end < text.len() {
            let window = &text[start..end];
            let min_cut = size / 2;
            if let Some(cut) = SEPARATORS
                .iter()
                .find_map(|sep| window.rfind(sep).filter(|&pos| pos >= min_cut))
            {
                end = start + cut;
            }
        }
        if end <= start {
            // Window smaller than one character
            end = text[start..]
                .chars()
                .next()
                .map_or(text.len(), |c| start + c.len_utf8());
        }

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        if end >= text.len() {
            break;
        }

        let mut next = floor_char_boundary(text, end.saturating_sub(overlap));
        if let Some(space) = text[next..end].find(char::is_whitespace) {
            next += space;
        }
        start = if next > start { next } else { end };
    }
    chunks
}

/// Lowercase and strip the accents common in Portuguese and Spanish text
pub fn fold(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

fn terms(text: &str) -> HashSet<String> {
    fold(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TERM_LEN)
        .map(str::to_string)
        .collect()
}
