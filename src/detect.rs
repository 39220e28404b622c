//! File type detection from the filename and a bounded read-ahead.
//!
//! Rules are evaluated in a fixed order and the first match wins:
//!
//! | # | Rule | Tag |
//! |---|------|-----|
//! | 1 | `.txt` with a line opening `#METABOLOMICS WORKBENCH` in its first 50 lines | `mwtab` |
//! | 2 | filename contains `_res.txt` | `results_txt` |
//! | 3 | `.xlsx`/`.xlsm` named like `normalized binned data` | `nmr_binned_xlsx` |
//! | 4 | `.htm`/`.html` mentioning `metabolite_name` | `metabo_table_html` |
//! | 5 | anything else, including empty files | `unknown` |
//!
//! Content wins over naming: a `_res.txt` file carrying the mwTab marker is
//! `mwtab`, because it is the only format this crate parses.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::warn;

use crate::models::DetectedType;

pub const MWTAB_MARKER: &str = "#METABOLOMICS WORKBENCH";

const MARKER_SCAN_LINES: usize = 50;

/// Classify a file from its name and the first bytes of its content.
pub fn detect(filename: &str, head: &[u8]) -> DetectedType {
    if head.is_empty() {
        return DetectedType::Unknown;
    }

    let name_lower = filename.to_lowercase();
    let ext = extension_of(&name_lower);
    let text = String::from_utf8_lossy(head);

    if ext == "txt" && has_mwtab_marker(&text) {
        return DetectedType::Mwtab;
    }
    if name_lower.contains("_res.txt") {
        return DetectedType::ResultsTxt;
    }
    if matches!(ext, "xlsx" | "xlsm") && name_lower.contains("normalized binned data") {
        return DetectedType::NmrBinnedXlsx;
    }
    if matches!(ext, "htm" | "html") && text.to_lowercase().contains("metabolite_name") {
        return DetectedType::MetaboTableHtml;
    }
    DetectedType::Unknown
}

/// Read up to `head_bytes` from `path` and classify it. Unreadable files
/// are `unknown`; this never fails.
pub fn detect_path(path: &Path, head_bytes: usize) -> DetectedType {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    match read_head(path, head_bytes) {
        Ok(head) => detect(&filename, &head),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "type detection could not read file");
            DetectedType::Unknown
        }
    }
}

fn read_head(path: &Path, head_bytes: usize) -> std::io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut head = Vec::with_capacity(head_bytes.min(64 * 1024));
    file.take(head_bytes as u64).read_to_end(&mut head)?;
    Ok(head)
}

fn has_mwtab_marker(text: &str) -> bool {
    text.lines()
        .take(MARKER_SCAN_LINES)
        .any(|line| mwtab_marker(line).is_some())
}

/// Text after the `#METABOLOMICS WORKBENCH` marker when `line` opens with it.
///
/// Case is ignored, as are leading whitespace and a byte-order mark. The
/// parser uses the same test, so anything detected as mwTab has a header.
pub fn mwtab_marker(line: &str) -> Option<&str> {
    let line = line.trim_start_matches('\u{feff}').trim_start();
    let head = line.get(..MWTAB_MARKER.len())?;
    head.eq_ignore_ascii_case(MWTAB_MARKER)
        .then(|| &line[MWTAB_MARKER.len()..])
}

/// Lower-case extension without the dot, or `""`.
pub fn extension_of(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext,
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MWTAB_HEAD: &[u8] =
        b"#METABOLOMICS WORKBENCH STUDY_ID:ST000315 ANALYSIS_ID:AN000501\nVERSION\t1\n";

    #[test]
    fn mwtab_by_content() {
        assert_eq!(detect("ST000315_AN000501.txt", MWTAB_HEAD), DetectedType::Mwtab);
    }

    #[test]
    fn marker_is_case_insensitive_within_scan_window() {
        let mut head = "\n".repeat(10).into_bytes();
        head.extend_from_slice(b"#metabolomics workbench\n");
        assert_eq!(detect("a.txt", &head), DetectedType::Mwtab);

        let mut inline = b"notes: see #METABOLOMICS WORKBENCH export\n".to_vec();
        inline.extend_from_slice(b"x\n");
        assert_eq!(detect("a.txt", &inline), DetectedType::Unknown);

        let mut late = "x\n".repeat(60).into_bytes();
        late.extend_from_slice(MWTAB_HEAD);
        assert_eq!(detect("a.txt", &late), DetectedType::Unknown);
    }

    #[test]
    fn byte_order_mark_before_marker() {
        let mut head = "\u{feff}".as_bytes().to_vec();
        head.extend_from_slice(MWTAB_HEAD);
        assert_eq!(detect("a.txt", &head), DetectedType::Mwtab);
        assert_eq!(
            mwtab_marker("\u{feff}#Metabolomics Workbench STUDY_ID:ST1"),
            Some(" STUDY_ID:ST1")
        );
        assert_eq!(mwtab_marker("#METABOLOMICS"), None);
    }

    #[test]
    fn mwtab_marker_outranks_res_name() {
        assert_eq!(detect("batch_res.txt", MWTAB_HEAD), DetectedType::Mwtab);
        assert_eq!(
            detect("batch_res.txt", b"compound\tp\nglucose\t0.01\n"),
            DetectedType::ResultsTxt
        );
    }

    #[test]
    fn nmr_binned_xlsx_by_name() {
        assert_eq!(
            detect("Normalized Binned Data ST001.xlsx", b"PK\x03\x04"),
            DetectedType::NmrBinnedXlsx
        );
        assert_eq!(detect("other.xlsx", b"PK\x03\x04"), DetectedType::Unknown);
    }

    #[test]
    fn html_table() {
        let head = b"<html><table><tr><th>Metabolite_name</th></tr></table></html>";
        assert_eq!(detect("table.HTML", head), DetectedType::MetaboTableHtml);
        assert_eq!(detect("page.htm", b"<html></html>"), DetectedType::Unknown);
    }

    #[test]
    fn marker_in_non_txt_is_unknown() {
        assert_eq!(detect("study.csv", MWTAB_HEAD), DetectedType::Unknown);
    }

    #[test]
    fn empty_and_binary_content() {
        assert_eq!(detect("empty.txt", b""), DetectedType::Unknown);
        assert_eq!(detect("empty_res.txt", b""), DetectedType::Unknown);
        assert_eq!(detect("blob.txt", &[0xff, 0xfe, 0x00, 0x9c]), DetectedType::Unknown);
    }

    #[test]
    fn unreadable_path_is_unknown() {
        assert_eq!(
            detect_path(Path::new("/nonexistent/dir/file.txt"), 1024),
            DetectedType::Unknown
        );
    }

    #[test]
    fn extension_parsing() {
        assert_eq!(extension_of("a.tar.gz"), "gz");
        assert_eq!(extension_of("README"), "");
        assert_eq!(extension_of(".hidden"), "");
    }
}
