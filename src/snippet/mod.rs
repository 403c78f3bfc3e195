//! Safe snippet extraction from the run-scoped clone.
//!
//! Reads byte ranges from files under the clone root with path-traversal
//! defense, binary and size checks, and encoding detection. Each file is
//! opened and decoded at most once per run; the cache also memoizes
//! failures so repeated misses stay cheap. Extraction never returns an
//! error — callers consult the result's `extraction_success` flag.

use chardetng::EncodingDetector;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{LimitsConfig, ParallelismConfig};
use crate::diff::normalize_path;

/// Default window when a request carries only a start line.
const DEFAULT_WINDOW_LINES: u32 = 50;

/// Bytes inspected for NUL detection.
const BINARY_SNIFF_BYTES: usize = 1024;

/// Bytes fed to the encoding detector.
const ENCODING_SNIFF_BYTES: usize = 8192;

/// Marker appended to over-long lines.
const LINE_TRUNCATION_MARKER: &str = "... [line truncated]";

/// Extensions never worth decoding.
const BINARY_EXTENSIONS: [&str; 24] = [
    "exe", "dll", "so", "dylib", "bin", "dat", "db", "sqlite", "jpg", "jpeg", "png", "gif", "bmp",
    "tiff", "pdf", "zip", "tar", "gz", "7z", "rar", "mp3", "mp4", "avi", "mov",
];

/// A snippet to extract: 1-indexed inclusive line range.
#[derive(Debug, Clone)]
pub struct SnippetRequest {
    pub file_path: String,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
}

/// Result of one extraction attempt.
#[derive(Debug, Clone, Serialize)]
pub struct SnippetResult {
    pub content: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub actual_lines: usize,
    pub file_size_bytes: u64,
    pub encoding: Option<String>,
    pub extraction_success: bool,
    pub extraction_error: Option<String>,
    pub is_truncated: bool,
    pub is_binary: bool,
}

impl SnippetResult {
    fn failure(request: &SnippetRequest, error: String, is_binary: bool, size: u64) -> Self {
        Self {
            content: String::new(),
            file_path: request.file_path.clone(),
            start_line: request.start_line.unwrap_or(1),
            end_line: request.end_line.unwrap_or(1),
            actual_lines: 0,
            file_size_bytes: size,
            encoding: None,
            extraction_success: false,
            extraction_error: Some(error),
            is_truncated: false,
            is_binary,
        }
    }
}

/// Decoded file state shared by every snippet of the same file.
#[derive(Debug, Clone)]
enum CacheEntry {
    Loaded(Arc<LoadedFile>),
    Failed { error: String, is_binary: bool, size: u64 },
}

#[derive(Debug)]
struct LoadedFile {
    lines: Vec<String>,
    encoding: String,
    size: u64,
}

/// Extracts snippets from the clone with a per-run content cache.
pub struct SnippetExtractor {
    clone_root: PathBuf,
    max_file_size_bytes: u64,
    max_line_length: usize,
    cache: HashMap<String, CacheEntry>,
}

impl SnippetExtractor {
    /// Create an extractor rooted at the clone directory.
    ///
    /// The root is canonicalized once so later prefix checks are reliable.
    pub fn new(clone_root: &Path, limits: &LimitsConfig) -> std::io::Result<Self> {
        Ok(Self {
            clone_root: clone_root.canonicalize()?,
            max_file_size_bytes: limits.max_file_size_bytes,
            max_line_length: limits.max_line_length,
            cache: HashMap::new(),
        })
    }

    /// Extract one snippet, loading and caching the file on first touch.
    pub fn extract(&mut self, request: &SnippetRequest) -> SnippetResult {
        let entry = self.entry_for(&request.file_path);
        slice_entry(&entry, request)
    }

    /// Extract many snippets, loading distinct files concurrently.
    ///
    /// Results come back in request order. Files load under the configured
    /// parallelism bound; snippets within one file are sliced from the
    /// single cached decode.
    pub async fn extract_many(
        &mut self,
        requests: &[SnippetRequest],
        parallelism: &ParallelismConfig,
    ) -> Vec<SnippetResult> {
        // Load every file we have not seen yet, bounded and in order
        let mut missing: Vec<String> = Vec::new();
        for request in requests {
            let key = normalize_path(&request.file_path);
            if !self.cache.contains_key(&key) && !missing.contains(&key) {
                missing.push(key);
            }
        }

        let root = self.clone_root.clone();
        let max_size = self.max_file_size_bytes;
        let max_line = self.max_line_length;
        let loaded: Vec<(String, CacheEntry)> = stream::iter(missing.into_iter().map(|key| {
            let root = root.clone();
            async move {
                let entry = tokio::task::spawn_blocking({
                    let key = key.clone();
                    move || load_file(&root, &key, max_size, max_line)
                })
                .await
                .unwrap_or_else(|e| CacheEntry::Failed {
                    error: format!("load task failed: {e}"),
                    is_binary: false,
                    size: 0,
                });
                (key, entry)
            }
        }))
        .buffered(parallelism.max_parallel_snippet_files.max(1))
        .collect()
        .await;

        for (key, entry) in loaded {
            self.cache.insert(key, entry);
        }

        requests.iter().map(|request| self.extract(request)).collect()
    }

    fn entry_for(&mut self, file_path: &str) -> CacheEntry {
        let key = normalize_path(file_path);
        if let Some(entry) = self.cache.get(&key) {
            return entry.clone();
        }
        let entry = load_file(&self.clone_root, &key, self.max_file_size_bytes, self.max_line_length);
        self.cache.insert(key, entry.clone());
        entry
    }
}

/// Resolve, validate, read, and decode one file.
fn load_file(root: &Path, rel_path: &str, max_size: u64, max_line_length: usize) -> CacheEntry {
    // Path resolution and traversal defense: canonicalize, then require the
    // clone root as a prefix.
    let joined = root.join(rel_path);
    let resolved = match joined.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            debug!("file not found: {}", joined.display());
            return CacheEntry::Failed {
                error: format!("File not found or path traversal detected: {rel_path}"),
                is_binary: false,
                size: 0,
            };
        }
    };
    if !resolved.starts_with(root) {
        warn!("path traversal detected: {rel_path}");
        return CacheEntry::Failed {
            error: format!("File not found or path traversal detected: {rel_path}"),
            is_binary: false,
            size: 0,
        };
    }
    if !resolved.is_file() {
        return CacheEntry::Failed {
            error: format!("File not found or path traversal detected: {rel_path}"),
            is_binary: false,
            size: 0,
        };
    }

    let size = match resolved.metadata() {
        Ok(meta) => meta.len(),
        Err(e) => {
            return CacheEntry::Failed {
                error: format!("File stat error: {e}"),
                is_binary: false,
                size: 0,
            };
        }
    };
    if size > max_size {
        return CacheEntry::Failed {
            error: format!("File too large: {size} bytes > {max_size} bytes"),
            is_binary: false,
            size,
        };
    }

    if let Some(ext) = resolved.extension().and_then(|e| e.to_str()) {
        if BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            return CacheEntry::Failed {
                error: format!("Binary file type: .{ext}"),
                is_binary: true,
                size,
            };
        }
    }

    let bytes = match std::fs::read(&resolved) {
        Ok(b) => b,
        Err(e) => {
            return CacheEntry::Failed {
                error: format!("File read error: {e}"),
                is_binary: false,
                size,
            };
        }
    };

    if bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0) {
        return CacheEntry::Failed {
            error: "Binary file detected".to_string(),
            is_binary: true,
            size,
        };
    }

    let (content, encoding) = decode(&bytes);
    let lines = content
        .lines()
        .map(|line| truncate_line(line, max_line_length))
        .collect();

    CacheEntry::Loaded(Arc::new(LoadedFile { lines, encoding, size }))
}

/// Decode bytes: strict UTF-8 first, then a detector guess on the first
/// 8 KiB. The guess is accepted only when it decodes the sample cleanly;
/// otherwise UTF-8 with lossy replacement wins.
fn decode(bytes: &[u8]) -> (String, String) {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return (text.to_string(), "utf-8".to_string());
    }

    let sample = &bytes[..bytes.len().min(ENCODING_SNIFF_BYTES)];
    let mut detector = EncodingDetector::new();
    detector.feed(sample, bytes.len() <= ENCODING_SNIFF_BYTES);
    let encoding = detector.guess(None, true);

    let (sample_text, _, sample_had_errors) = encoding.decode(sample);
    drop(sample_text);
    if !sample_had_errors {
        let (text, _, _) = encoding.decode(bytes);
        return (text.into_owned(), encoding.name().to_lowercase());
    }

    (String::from_utf8_lossy(bytes).into_owned(), "utf-8".to_string())
}

fn truncate_line(line: &str, max_line_length: usize) -> String {
    if max_line_length == 0 || line.len() <= max_line_length {
        return line.to_string();
    }
    let keep = max_line_length.saturating_sub(LINE_TRUNCATION_MARKER.len());
    let mut end = keep;
    while end > 0 && !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &line[..end], LINE_TRUNCATION_MARKER)
}

/// Slice a cached decode into the requested 1-indexed inclusive range.
fn slice_entry(entry: &CacheEntry, request: &SnippetRequest) -> SnippetResult {
    let file = match entry {
        CacheEntry::Loaded(file) => file,
        CacheEntry::Failed { error, is_binary, size } => {
            return SnippetResult::failure(request, error.clone(), *is_binary, *size);
        }
    };

    let total_lines = file.lines.len() as u32;
    let start_line = request.start_line.unwrap_or(1).max(1);
    let end_line = request
        .end_line
        .unwrap_or_else(|| (start_line + DEFAULT_WINDOW_LINES).min(total_lines))
        .max(start_line);

    if start_line > total_lines {
        return SnippetResult {
            file_size_bytes: file.size,
            encoding: Some(file.encoding.clone()),
            ..SnippetResult::failure(
                request,
                format!("Start line {start_line} exceeds file length {total_lines}"),
                false,
                file.size,
            )
        };
    }

    let start_idx = (start_line - 1) as usize;
    let end_idx = (end_line as usize).min(file.lines.len());
    let extracted = &file.lines[start_idx..end_idx];
    let actual_end = start_line + extracted.len() as u32 - 1;

    SnippetResult {
        content: extracted.join("\n"),
        file_path: request.file_path.clone(),
        start_line,
        end_line: actual_end,
        actual_lines: extracted.len(),
        file_size_bytes: file.size,
        encoding: Some(file.encoding.clone()),
        extraction_success: true,
        extraction_error: None,
        is_truncated: actual_end < end_line,
        is_binary: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup(files: &[(&str, &[u8])]) -> (TempDir, SnippetExtractor) {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(full, content).unwrap();
        }
        let extractor = SnippetExtractor::new(dir.path(), &LimitsConfig::default()).unwrap();
        (dir, extractor)
    }

    fn request(path: &str, start: Option<u32>, end: Option<u32>) -> SnippetRequest {
        SnippetRequest {
            file_path: path.to_string(),
            start_line: start,
            end_line: end,
        }
    }

    #[test]
    fn test_extract_range_inclusive() {
        let (_dir, mut extractor) = setup(&[("src/lib.rs", b"l1\nl2\nl3\nl4\nl5\n")]);
        let result = extractor.extract(&request("src/lib.rs", Some(2), Some(4)));

        assert!(result.extraction_success);
        assert_eq!(result.content, "l2\nl3\nl4");
        assert_eq!(result.start_line, 2);
        assert_eq!(result.end_line, 4);
        assert_eq!(result.actual_lines, 3);
        assert_eq!(result.encoding.as_deref(), Some("utf-8"));
    }

    #[test]
    fn test_default_window_when_only_start() {
        let content = (1..=120).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let (_dir, mut extractor) = setup(&[("big.txt", content.as_bytes())]);
        let result = extractor.extract(&request("big.txt", Some(10), None));

        assert!(result.extraction_success);
        assert_eq!(result.start_line, 10);
        assert_eq!(result.end_line, 60);
    }

    #[test]
    fn test_range_clamped_to_file_length() {
        let (_dir, mut extractor) = setup(&[("short.txt", b"a\nb\nc\n")]);
        let result = extractor.extract(&request("short.txt", Some(2), Some(99)));

        assert!(result.extraction_success);
        assert_eq!(result.end_line, 3);
        assert!(result.is_truncated);
    }

    #[test]
    fn test_start_beyond_eof_fails() {
        let (_dir, mut extractor) = setup(&[("short.txt", b"a\nb\n")]);
        let result = extractor.extract(&request("short.txt", Some(50), Some(60)));

        assert!(!result.extraction_success);
        assert!(result.extraction_error.unwrap().contains("exceeds file length"));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let (dir, mut extractor) = setup(&[("inner.txt", b"data\n")]);
        fs::write(dir.path().parent().unwrap().join("outside.txt"), "secret").ok();
        let result = extractor.extract(&request("../outside.txt", Some(1), None));

        assert!(!result.extraction_success);
        assert!(result.extraction_error.unwrap().contains("path traversal"));
    }

    #[test]
    fn test_missing_file_fails_and_is_memoized() {
        let (_dir, mut extractor) = setup(&[]);
        let r1 = extractor.extract(&request("nope.rs", Some(1), None));
        assert!(!r1.extraction_success);

        // Second miss comes from the failure cache
        let r2 = extractor.extract(&request("nope.rs", Some(5), None));
        assert!(!r2.extraction_success);
        assert_eq!(extractor.cache.len(), 1);
    }

    #[test]
    fn test_binary_extension_rejected() {
        let (_dir, mut extractor) = setup(&[("logo.png", b"\x89PNG data")]);
        let result = extractor.extract(&request("logo.png", Some(1), None));

        assert!(!result.extraction_success);
        assert!(result.is_binary);
    }

    #[test]
    fn test_nul_byte_means_binary() {
        let (_dir, mut extractor) = setup(&[("blob.txt", b"ab\x00cd")]);
        let result = extractor.extract(&request("blob.txt", Some(1), None));

        assert!(!result.extraction_success);
        assert!(result.is_binary);
    }

    #[test]
    fn test_oversize_file_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("big.txt"), "x".repeat(256)).unwrap();
        let mut limits = LimitsConfig::default();
        limits.max_file_size_bytes = 100;
        let mut extractor = SnippetExtractor::new(dir.path(), &limits).unwrap();

        let result = extractor.extract(&request("big.txt", Some(1), None));
        assert!(!result.extraction_success);
        assert!(result.extraction_error.unwrap().contains("too large"));
    }

    #[test]
    fn test_long_lines_truncated_with_marker() {
        let dir = TempDir::new().unwrap();
        let long = format!("short\n{}\n", "y".repeat(500));
        fs::write(dir.path().join("wide.txt"), long).unwrap();
        let mut limits = LimitsConfig::default();
        limits.max_line_length = 100;
        let mut extractor = SnippetExtractor::new(dir.path(), &limits).unwrap();

        let result = extractor.extract(&request("wide.txt", Some(1), Some(2)));
        assert!(result.extraction_success);
        let second_line = result.content.lines().nth(1).unwrap();
        assert_eq!(second_line.len(), 100);
        assert!(second_line.ends_with(LINE_TRUNCATION_MARKER));
    }

    #[test]
    fn test_latin1_fallback_decodes() {
        // 0xE9 is é in windows-1252 and invalid as a UTF-8 start byte here
        let (_dir, mut extractor) = setup(&[("legacy.txt", b"caf\xe9 au lait\n")]);
        let result = extractor.extract(&request("legacy.txt", Some(1), None));

        assert!(result.extraction_success);
        assert!(result.content.contains("café"));
        assert_ne!(result.encoding.as_deref(), Some("utf-8"));
    }

    #[tokio::test]
    async fn test_extract_many_caches_per_file() {
        let (_dir, mut extractor) = setup(&[
            ("a.rs", b"a1\na2\na3\n"),
            ("b.rs", b"b1\nb2\n"),
        ]);
        let requests = vec![
            request("a.rs", Some(1), Some(1)),
            request("b.rs", Some(1), Some(2)),
            request("a.rs", Some(2), Some(3)),
            request("missing.rs", Some(1), None),
        ];
        let results = extractor
            .extract_many(&requests, &ParallelismConfig::default())
            .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].content, "a1");
        assert_eq!(results[1].content, "b1\nb2");
        assert_eq!(results[2].content, "a2\na3");
        assert!(!results[3].extraction_success);
        // Three distinct files touched, three cache entries
        assert_eq!(extractor.cache.len(), 3);
    }
}
