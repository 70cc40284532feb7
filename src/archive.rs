//! In-memory ZIP archives for multi-file downloads.

use std::collections::HashSet;
use std::io::{Cursor, Write};

use chrono::{DateTime, Local};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Builds a deflated ZIP in memory, renaming duplicate entries.
pub struct ArchiveBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    names: HashSet<String>,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
            names: HashSet::new(),
        }
    }

    /// Add a file, returning the entry name actually used.
    ///
    /// Only the final path component of `name` is kept, so every entry
    /// extracts into the archive's top level.
    pub fn add(&mut self, name: &str, data: &[u8]) -> zip::result::ZipResult<String> {
        let name = self.unique_name(entry_name(name));
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        self.writer.start_file(name.as_str(), options)?;
        self.writer.write_all(data)?;
        Ok(name)
    }

    pub fn finish(self) -> zip::result::ZipResult<Vec<u8>> {
        Ok(self.writer.finish()?.into_inner())
    }

    /// `a.pdf`, `a (2).pdf`, `a (3).pdf`, ...
    fn unique_name(&mut self, name: &str) -> String {
        let name = if name.is_empty() { "document" } else { name };
        if self.names.insert(name.to_string()) {
            return name.to_string();
        }
        let (stem, ext) = match name.rfind('.') {
            Some(idx) if idx > 0 => name.split_at(idx),
            _ => (name, ""),
        };
        let mut n = 2;
        loop {
            let candidate = format!("{} ({}){}", stem, n, ext);
            if self.names.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Last component of a client-supplied name, splitting on both separators.
fn entry_name(name: &str) -> &str {
    match name.rsplit(['/', '\\']).next() {
        Some("." | "..") | None => "",
        Some(last) => last,
    }
}

/// Download name for an archive, e.g. `OCRmyPDF.20240131_142501.zip`.
pub fn archive_file_name(prefix: &str, now: DateTime<Local>) -> String {
    format!("{}.{}.zip", prefix, now.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Read;

    #[test]
    fn test_archive_contents() {
        let mut builder = ArchiveBuilder::new();
        assert_eq!(builder.add("a.pdf", b"first").unwrap(), "a.pdf");
        assert_eq!(builder.add("a.pdf", b"second").unwrap(), "a (2).pdf");
        assert_eq!(builder.add("README", b"third").unwrap(), "README");
        let bytes = builder.finish().unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);
        let mut content = String::new();
        archive
            .by_name("a (2).pdf")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "second");
    }

    #[test]
    fn test_entry_names_lose_directories() {
        let mut builder = ArchiveBuilder::new();
        assert_eq!(builder.add("../x.pdf", b"up").unwrap(), "x.pdf");
        assert_eq!(builder.add("/etc/x.pdf", b"abs").unwrap(), "x (2).pdf");
        assert_eq!(builder.add("C:\\fakepath\\scan.pdf", b"win").unwrap(), "scan.pdf");
        assert_eq!(builder.add("..", b"dots").unwrap(), "document");
        let bytes = builder.finish().unwrap();

        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        for name in archive.file_names() {
            assert!(!name.contains('/') && !name.contains('\\'), "{}", name);
        }
    }

    #[test]
    fn test_archive_file_name() {
        let now = Local.with_ymd_and_hms(2024, 1, 31, 14, 25, 1).unwrap();
        assert_eq!(
            archive_file_name("OCRmyPDF", now),
            "OCRmyPDF.20240131_142501.zip"
        );
    }
}
