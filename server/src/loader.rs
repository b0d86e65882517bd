use std::io::Read;
use std::path::{Path, PathBuf};

use lopdf::Document as LoDocument;
use regex::Regex;
use tracing::{debug, info};

use crate::error::AppError;

/// Raw text pulled out of one document (or one PDF page).
#[derive(Debug, Clone, PartialEq)]
pub struct TextSegment {
    pub source: PathBuf,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Text,
}

impl DocumentKind {
    /// Resolves the extractor from the file extension alone; never touches the filesystem.
    pub fn from_path(path: &Path) -> Result<Self, AppError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(DocumentKind::Pdf),
            "docx" | "doc" => Ok(DocumentKind::Docx),
            "txt" => Ok(DocumentKind::Text),
            _ => Err(AppError::UnsupportedFormat { path: path.display().to_string() }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// Zero means no limit.
    pub pdf_max_pages: usize,
}

pub fn load_document(path: &Path, opts: &LoaderOptions) -> Result<Vec<TextSegment>, AppError> {
    let kind = DocumentKind::from_path(path)?;
    let load_err = |reason: String| AppError::DocumentLoad { path: path.display().to_string(), reason };
    let segments = match kind {
        DocumentKind::Pdf => read_pdf_pages(path, opts.pdf_max_pages).map_err(|e| load_err(e.to_string()))?,
        DocumentKind::Docx => {
            let text = read_docx_text(path).map_err(|e| load_err(e.to_string()))?;
            vec![TextSegment { source: path.to_path_buf(), text }]
        }
        DocumentKind::Text => {
            let raw = std::fs::read(path).map_err(|e| load_err(e.to_string()))?;
            vec![TextSegment { source: path.to_path_buf(), text: String::from_utf8_lossy(&raw).into_owned() }]
        }
    };
    let segments: Vec<TextSegment> = segments.into_iter().filter(|s| !s.text.trim().is_empty()).collect();
    debug!(path = %path.display(), ?kind, segments = segments.len(), "document loaded");
    Ok(segments)
}

/// Loads every path in order. Extensions are checked for the whole batch before
/// any file is opened; the first failing document aborts the batch.
pub fn load_documents(paths: &[PathBuf], opts: &LoaderOptions) -> Result<Vec<TextSegment>, AppError> {
    for p in paths {
        DocumentKind::from_path(p)?;
    }
    let mut all = Vec::new();
    let mut loaded: Vec<String> = Vec::new();
    for p in paths {
        match load_document(p, opts) {
            Ok(segments) => {
                all.extend(segments);
                loaded.push(p.display().to_string());
            }
            Err(err) => return Err(AppError::PreparationAborted { loaded, source: Box::new(err) }),
        }
    }
    info!(documents = paths.len(), segments = all.len(), "documents loaded");
    Ok(all)
}

fn read_pdf_pages(path: &Path, max_pages: usize) -> anyhow::Result<Vec<TextSegment>> {
    let doc = LoDocument::load(path)?;
    let mut out = Vec::new();
    for (page_count, page_id) in doc.get_pages().values().enumerate() {
        if max_pages > 0 && page_count >= max_pages {
            break;
        }
        let page = doc.get_page_content(*page_id)?;
        let content = lopdf::content::Content::decode(&page)?;
        let mut text = String::new();
        for operation in content.operations {
            match operation.operator.as_str() {
                "Tj" | "'" | "\"" => {
                    for operand in &operation.operands {
                        push_pdf_string(operand, &mut text);
                    }
                    text.push('\n');
                }
                "TJ" => {
                    for operand in &operation.operands {
                        if let lopdf::Object::Array(items) = operand {
                            for item in items {
                                push_pdf_string(item, &mut text);
                            }
                        }
                    }
                    text.push('\n');
                }
                _ => {}
            }
        }
        out.push(TextSegment { source: path.to_path_buf(), text });
    }
    Ok(out)
}

fn push_pdf_string(obj: &lopdf::Object, out: &mut String) {
    if let lopdf::Object::String(bytes, _) = obj {
        out.push_str(&String::from_utf8_lossy(bytes));
    }
}

fn read_docx_text(path: &Path) -> anyhow::Result<String> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut xml = String::new();
    archive.by_name("word/document.xml")?.read_to_string(&mut xml)?;
    docx_xml_to_text(&xml)
}

/// Flattens WordprocessingML body text: `w:t` runs are concatenated, paragraphs and
/// breaks become newlines, tabs stay tabs.
fn docx_xml_to_text(xml: &str) -> anyhow::Result<String> {
    let re = Regex::new(r"(?s)</w:p>|<w:tab/>|<w:br/>|<w:t(?:\s[^>]*)?>(.*?)</w:t>")?;
    let mut out = String::new();
    for cap in re.captures_iter(xml) {
        match cap.get(1) {
            Some(t) => out.push_str(&unescape_xml(t.as_str())),
            None => match cap.get(0).map(|m| m.as_str()) {
                Some("<w:tab/>") => out.push('\t'),
                _ => out.push('\n'),
            },
        }
    }
    Ok(out)
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_pdf(path: &Path, pages: &[&[&str]]) {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Object, Stream};
        let mut doc = LoDocument::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! { "Type" => "Font", "Subtype" => "Type1", "BaseFont" => "Courier" });
        let resources_id = doc.add_object(dictionary! { "Font" => dictionary! { "F1" => font_id } });
        let mut kids: Vec<Object> = Vec::new();
        for lines in pages {
            let mut ops = vec![Operation::new("BT", vec![]), Operation::new("Tf", vec!["F1".into(), 12.into()])];
            for line in lines.iter() {
                ops.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
            }
            ops.push(Operation::new("ET", vec![]));
            let content = Content { operations: ops };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! { "Type" => "Page", "Parent" => pages_id, "Contents" => content_id });
            kids.push(page_id.into());
        }
        let pages = dictionary! {
            "Type" => "Pages",
            "Count" => kids.len() as i64,
            "Kids" => kids,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
    }

    fn write_docx(path: &Path, body_xml: &str) {
        let file = std::fs::File::create(path).unwrap();
        let mut zw = zip::ZipWriter::new(file);
        let opts = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zw.start_file("word/document.xml", opts).unwrap();
        zw.write_all(body_xml.as_bytes()).unwrap();
        zw.finish().unwrap();
    }

    #[test]
    fn txt_yields_one_segment() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("sky.txt");
        std::fs::write(&p, "The sky is blue.").unwrap();
        let segs = load_document(&p, &LoaderOptions::default()).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].text, "The sky is blue.");
        assert_eq!(segs[0].source, p);
    }

    #[test]
    fn pdf_text_operators_are_extracted_per_page() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("report.PDF");
        write_pdf(&p, &[&["Quarterly revenue grew.", "Costs were flat."]]);
        let segs = load_document(&p, &LoaderOptions::default()).unwrap();
        assert_eq!(segs.len(), 1);
        assert!(segs[0].text.contains("Quarterly revenue grew."));
        assert!(segs[0].text.contains("Costs were flat."));
    }

    #[test]
    fn pdf_page_limit_stops_after_the_first_pages() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("book.pdf");
        write_pdf(&p, &[&["Chapter one."], &["Chapter two."], &["Chapter three."]]);

        let all = load_document(&p, &LoaderOptions::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[2].text.contains("Chapter three."));

        let limited = load_document(&p, &LoaderOptions { pdf_max_pages: 2 }).unwrap();
        assert_eq!(limited.len(), 2);
        assert!(limited[0].text.contains("Chapter one."));
        assert!(limited[1].text.contains("Chapter two."));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("notes.docx");
        let xml = r#"<w:document><w:body><w:p><w:r><w:t>Fish &amp; chips</w:t></w:r></w:p><w:p><w:r><w:t xml:space="preserve">second </w:t><w:tab/><w:t>line</w:t></w:r></w:p></w:body></w:document>"#;
        write_docx(&p, xml);
        let segs = load_document(&p, &LoaderOptions::default()).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].text, "Fish & chips\nsecond \tline\n");
    }

    #[test]
    fn unsupported_extension_fails_before_io() {
        // the path does not exist: an UnsupportedFormat (not DocumentLoad) proves no read happened
        let err = load_document(Path::new("/nonexistent/data.csv"), &LoaderOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFormat { .. }));
        let err = load_document(Path::new("/nonexistent/README"), &LoaderOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFormat { .. }));
    }

    #[test]
    fn batch_rejects_bad_extension_before_loading_anything() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.txt");
        std::fs::write(&good, "alpha").unwrap();
        let err = load_documents(&[good, PathBuf::from("b.xlsx")], &LoaderOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFormat { .. }));
    }

    #[test]
    fn batch_aborts_on_missing_file_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.txt");
        std::fs::write(&good, "alpha").unwrap();
        let missing = dir.path().join("gone.txt");
        let err = load_documents(&[good.clone(), missing], &LoaderOptions::default()).unwrap_err();
        match err {
            AppError::PreparationAborted { loaded, source } => {
                assert_eq!(loaded, vec![good.display().to_string()]);
                assert!(matches!(*source, AppError::DocumentLoad { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn legacy_doc_that_is_not_a_zip_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("old.doc");
        std::fs::write(&p, b"\xD0\xCF\x11\xE0 binary word").unwrap();
        let err = load_document(&p, &LoaderOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::DocumentLoad { .. }));
    }
}
