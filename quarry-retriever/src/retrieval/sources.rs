//! Where documents come from.
//!
//! The ingestion pipeline consumes any stream of [`SourceItem`]s. A document
//! that could not be read travels as an error so it shows up in the report.
//! [`FileSource`] builds such a stream from the text files under a data
//! directory.

use crate::error::{Classify, ErrorKind};
use futures::stream::{self, BoxStream, StreamExt};
use std::path::{Path, PathBuf};

/// One document to ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    /// Stable identifier; chunk ids are derived from it.
    pub source_id: String,
    pub full_text: String,
}

impl SourceDocument {
    pub fn new(source_id: impl Into<String>, full_text: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            full_text: full_text.into(),
        }
    }
}

/// One element of a document stream.
pub type SourceItem = Result<SourceDocument, SourceError>;

/// Stream over in-memory documents, mostly for tests and embedding callers.
pub fn from_documents(documents: Vec<SourceDocument>) -> BoxStream<'static, SourceItem> {
    stream::iter(documents).map(Ok).boxed()
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Data directory {} does not exist or is not a directory", path.display())]
    MissingDirectory { path: PathBuf },

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        source_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SourceError {
    /// The document this error belongs to, if it is about one document
    pub fn source_id(&self) -> Option<&str> {
        match self {
            SourceError::Read { source_id, .. } => Some(source_id),
            SourceError::MissingDirectory { .. } => None,
        }
    }
}

impl Classify for SourceError {
    fn kind(&self) -> ErrorKind {
        match self {
            SourceError::MissingDirectory { .. } => ErrorKind::Configuration,
            SourceError::Read { .. } => ErrorKind::Source,
        }
    }
}

/// Text files under a directory, filtered by extension.
///
/// Hidden files and anything excluded by `.gitignore`/`.ignore` files are
/// skipped. The `source_id` of a file is its path relative to the data
/// directory, with `/` separators.
#[derive(Debug, Clone)]
pub struct FileSource {
    data_dir: PathBuf,
    extensions: Vec<String>,
}

impl FileSource {
    pub fn new(data_dir: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            data_dir: data_dir.into(),
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Check if a file should be ingested based on its path
    pub fn should_index_file(&self, file_path: &Path) -> bool {
        if let Some(filename) = file_path.file_name().and_then(|n| n.to_str()) {
            if filename.starts_with('.') {
                return false;
            }
        }

        match file_path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            }
            None => false,
        }
    }

    /// Walk the data directory and return matching files, sorted by path.
    pub fn discover(&self) -> Result<Vec<PathBuf>, SourceError> {
        if !self.data_dir.is_dir() {
            return Err(SourceError::MissingDirectory {
                path: self.data_dir.clone(),
            });
        }

        let mut files = Vec::new();
        for entry in ignore::WalkBuilder::new(&self.data_dir).build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(
                        "Skipping unreadable entry under {}: {}",
                        self.data_dir.display(),
                        e
                    );
                    continue;
                }
            };
            let is_file = entry.file_type().is_some_and(|t| t.is_file());
            if is_file && self.should_index_file(entry.path()) {
                files.push(entry.into_path());
            }
        }
        files.sort();

        tracing::info!(
            "Found {} files to ingest under {}",
            files.len(),
            self.data_dir.display()
        );
        Ok(files)
    }

    fn source_id_for(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.data_dir).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Discover files and read them lazily as they are pulled.
    ///
    /// A file that cannot be read yields a [`SourceError::Read`]. Invalid
    /// UTF-8 is replaced rather than rejected.
    pub fn into_stream(self) -> Result<BoxStream<'static, SourceItem>, SourceError> {
        let files = self.discover()?;
        let stream = stream::iter(files)
            .then(move |path| {
                let source_id = self.source_id_for(&path);
                async move {
                    match tokio::fs::read(&path).await {
                        Ok(bytes) => Ok(SourceDocument {
                            source_id,
                            full_text: String::from_utf8_lossy(&bytes).into_owned(),
                        }),
                        Err(source) => {
                            tracing::warn!("Failed to read {}: {}", path.display(), source);
                            Err(SourceError::Read {
                                source_id,
                                path,
                                source,
                            })
                        }
                    }
                }
            })
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn extensions() -> Vec<String> {
        vec!["txt".to_string(), ".md".to_string()]
    }

    #[test]
    fn test_should_index_file() {
        let source = FileSource::new("data", &extensions());

        assert!(source.should_index_file(Path::new("data/notes.txt")));
        assert!(source.should_index_file(Path::new("data/README.MD")));

        assert!(!source.should_index_file(Path::new("data/main.rs")));
        assert!(!source.should_index_file(Path::new("data/.hidden.txt")));
        assert!(!source.should_index_file(Path::new("data/LICENSE")));
    }

    #[tokio::test]
    async fn test_stream_reads_matching_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("b.txt"), "bravo")?;
        std::fs::write(dir.path().join("a.md"), "# alpha")?;
        std::fs::write(dir.path().join("skip.json"), "{}")?;
        std::fs::create_dir(dir.path().join("nested"))?;
        std::fs::write(dir.path().join("nested").join("c.txt"), [0x63, 0xff, 0x64])?;

        let source = FileSource::new(dir.path(), &extensions());
        let docs: Vec<SourceDocument> = source
            .into_stream()?
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;

        let ids: Vec<&str> = docs.iter().map(|d| d.source_id.as_str()).collect();
        assert_eq!(ids, ["a.md", "b.txt", "nested/c.txt"]);
        assert_eq!(docs[1].full_text, "bravo");
        assert_eq!(docs[2].full_text, "c\u{fffd}d");
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_file_is_an_error_item() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("kept.txt"), "still here")?;
        std::fs::write(dir.path().join("gone.txt"), "removed before reading")?;

        let stream = FileSource::new(dir.path(), &extensions()).into_stream()?;
        std::fs::remove_file(dir.path().join("gone.txt"))?;
        let items: Vec<SourceItem> = stream.collect().await;

        assert_eq!(items.len(), 2);
        let err = items[0].as_ref().unwrap_err();
        assert_eq!(err.source_id(), Some("gone.txt"));
        assert_eq!(err.kind(), ErrorKind::Source);
        assert_eq!(items[1].as_ref().unwrap().full_text, "still here");
        Ok(())
    }

    #[test]
    fn test_missing_directory() {
        let source = FileSource::new("/definitely/not/here", &extensions());
        let err = source.discover().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
