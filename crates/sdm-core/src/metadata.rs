//! FFmpeg metadata sidecar (`;FFMETADATA1`) rendering.
//!
//! Resolvers hand over tag/chapter data; this module renders the sidecar
//! text that the transcoder embeds with `-map_metadata`. Keys and values
//! escape `=`, `;`, `#`, `\` and newlines with a backslash.

use std::path::Path;

/// One chapter mark, in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub start_ms: u64,
    pub end_ms: u64,
    pub title: Option<String>,
}

/// Metadata to embed: flat tags plus optional chapters.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub tags: Vec<(String, String)>,
    pub chapters: Vec<Chapter>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.chapters.is_empty()
    }

    /// Render the full sidecar document.
    pub fn render(&self) -> String {
        let mut out = String::from(";FFMETADATA1\n");
        for (name, value) in &self.tags {
            out.push_str(&escape(name));
            out.push('=');
            out.push_str(&escape(value));
            out.push('\n');
        }
        out.push('\n');
        for chapter in &self.chapters {
            out.push_str("[CHAPTER]\nTIMEBASE=1/1000\n");
            out.push_str(&format!("START={}\n", chapter.start_ms));
            out.push_str(&format!("END={}\n", chapter.end_ms));
            if let Some(ref title) = chapter.title {
                out.push_str(&format!("title={}\n", escape(title)));
            }
            out.push('\n');
        }
        out
    }
}

/// Escape metadata-special characters with a backslash.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '=' | ';' | '#' | '\\' | '\n') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Write sidecar text next to the target file as `<target>.meta`.
pub fn write_sidecar(target: &Path, content: &str) -> std::io::Result<std::path::PathBuf> {
    let mut name = target.as_os_str().to_owned();
    name.push(".meta");
    let path = std::path::PathBuf::from(name);
    std::fs::write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_special_characters() {
        assert_eq!(escape("a=b"), "a\\=b");
        assert_eq!(escape("x;y#z"), "x\\;y\\#z");
        assert_eq!(escape("back\\slash"), "back\\\\slash");
        assert_eq!(escape("line\nbreak"), "line\\\nbreak");
        assert_eq!(escape("plain title"), "plain title");
    }

    #[test]
    fn render_starts_with_magic_and_contains_tags() {
        let meta = Metadata {
            tags: vec![
                ("title".into(), "My; Video".into()),
                ("artist".into(), "Some=One".into()),
            ],
            chapters: vec![],
        };
        let doc = meta.render();
        assert!(doc.starts_with(";FFMETADATA1\n"));
        assert!(doc.contains("title=My\\; Video\n"));
        assert!(doc.contains("artist=Some\\=One\n"));
    }

    #[test]
    fn render_chapter_blocks() {
        let meta = Metadata {
            tags: vec![],
            chapters: vec![Chapter {
                start_ms: 0,
                end_ms: 90_000,
                title: Some("Intro".into()),
            }],
        };
        let doc = meta.render();
        assert!(doc.contains("[CHAPTER]\nTIMEBASE=1/1000\nSTART=0\nEND=90000\ntitle=Intro\n"));
    }

    #[test]
    fn sidecar_path_appends_meta() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("movie.mp4");
        let path = write_sidecar(&target, ";FFMETADATA1\n").unwrap();
        assert_eq!(path, dir.path().join("movie.mp4.meta"));
        assert!(path.is_file());
    }
}
