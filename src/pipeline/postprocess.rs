//! Post-processing and quality scoring for converted Markdown.
//!
//! [`post_process`] runs on whatever a backend produced. OCR output gets an
//! extra pass for scanner artefacts (doubled spaces, `l`/`1` and `O`/`0`
//! confusions, soft hyphens); every output gets the structural passes
//! (header spacing, list markers, blank-line collapsing).
//!
//! [`validate_quality`] scores a text for structural plausibility. The score
//! is advisory: the converter logs it but acceptance is decided by length.
//!
//! [`clean_llm_page`] removes the quirks vision models add to a page
//! transcription before it is stitched into the document.

use crate::output::QualityScore;
use once_cell::sync::Lazy;
use regex::Regex;

/// Clean up converted Markdown.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. OCR only: collapse runs of spaces, fix whole-word `l`→`1`, `O`→`0`
/// 3. Strip soft hyphens
/// 4. Normalise list markers to a single following space
/// 5. Blank line before and after every header (outside code fences)
/// 6. Blank line between a list and the paragraph that follows it
/// 7. Collapse 3+ consecutive newlines to 2
///
/// Whitespace-only input is returned unchanged.
pub fn post_process(markdown: &str, is_ocr: bool) -> String {
    if markdown.trim().is_empty() {
        return markdown.to_string();
    }

    let mut s = normalise_line_endings(markdown);
    if is_ocr {
        s = collapse_spaces(&s);
        s = fix_ocr_confusions(&s);
    }
    let s = strip_soft_hyphens(&s);
    let s = normalise_list_markers(&s);
    let s = space_headers(&s);
    let s = separate_lists(&s);
    collapse_newlines(&s)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: OCR artefacts ────────────────────────────────────────────────────

static RE_MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").unwrap());
static RE_LONE_L: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bl\b").unwrap());
static RE_LONE_O: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bO\b").unwrap());

fn collapse_spaces(input: &str) -> String {
    RE_MULTI_SPACE.replace_all(input, " ").into_owned()
}

fn fix_ocr_confusions(input: &str) -> String {
    let s = RE_LONE_L.replace_all(input, "1");
    RE_LONE_O.replace_all(&s, "0").into_owned()
}

// ── Rule 3: Soft hyphens ─────────────────────────────────────────────────────

fn strip_soft_hyphens(input: &str) -> String {
    input.replace('\u{00AD}', "")
}

// ── Rule 4: List markers ─────────────────────────────────────────────────────

static RE_LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^([ \t]*)([-*+]|\d{1,3}\.)[ \t]+(\S)").unwrap());

fn normalise_list_markers(input: &str) -> String {
    RE_LIST_MARKER.replace_all(input, "$1$2 $3").into_owned()
}

// ── Rule 5: Header spacing ───────────────────────────────────────────────────

static RE_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s").unwrap());

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn space_headers(input: &str) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(input.len() / 32 + 8);
    let mut in_fence = false;
    let mut after_header = false;

    for line in input.split('\n') {
        if is_fence(line) {
            in_fence = !in_fence;
        }
        let blank = line.trim().is_empty();

        if !in_fence && RE_HEADER.is_match(line) {
            if out.last().is_some_and(|l| !l.trim().is_empty()) {
                out.push("");
            }
            out.push(line);
            after_header = true;
            continue;
        }

        if after_header && !blank {
            out.push("");
        }
        after_header = false;
        out.push(line);
    }

    out.join("\n")
}

// ── Rule 6: List / paragraph separation ──────────────────────────────────────

static RE_LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[ \t]*([-*+]|\d{1,3}\.) ").unwrap());

fn separate_lists(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut in_list = false;
    let mut in_fence = false;

    for line in input.split('\n') {
        if is_fence(line) {
            in_fence = !in_fence;
        }
        if in_fence {
            in_list = false;
            out.push(line);
            continue;
        }
        if RE_LIST_ITEM.is_match(line) {
            in_list = true;
        } else if line.trim().is_empty() {
            in_list = false;
        } else if in_list && !line.starts_with([' ', '\t']) {
            out.push("");
            in_list = false;
        }
        out.push(line);
    }

    out.join("\n")
}

// ── Rule 7: Collapse blank lines ─────────────────────────────────────────────

static RE_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Collapse runs of three or more newlines to exactly two.
pub fn collapse_newlines(input: &str) -> String {
    RE_NEWLINES.replace_all(input, "\n\n").into_owned()
}

// ── Quality validation ───────────────────────────────────────────────────────

static RE_GARBLED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[^\w\s.,?!:;\-'"()\[\]{}@#$%&*+=/\\|<>~`]+"#).unwrap()
});
static RE_HEADER_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#+\s").unwrap());

/// Score Markdown for structural plausibility.
///
/// Three independent sub-scores, averaged without weights:
///
/// | check | bad | good |
/// |-------|-----|------|
/// | garbled-character ratio > 0.1 | 0.3 | 0.8 |
/// | fewer than 2 headers in > 500 chars | 0.5 | 0.9 |
/// | blank-line ratio > 0.4 | 0.6 | 0.9 |
///
/// Empty or whitespace-only input scores exactly `0.0`.
pub fn validate_quality(markdown: &str) -> QualityScore {
    if markdown.trim().is_empty() {
        return QualityScore {
            score: 0.0,
            issues: vec!["Empty content".to_string()],
        };
    }

    let mut issues = Vec::new();
    let mut scores = [0.0f64; 3];

    let total_chars = markdown.chars().count();
    let garbled_chars: usize = RE_GARBLED
        .find_iter(markdown)
        .map(|m| m.as_str().chars().count())
        .sum();
    let garbled_ratio = garbled_chars as f64 / total_chars as f64;
    if garbled_ratio > 0.1 {
        issues.push(format!("High ratio of garbled characters ({:.2})", garbled_ratio));
        scores[0] = 0.3;
    } else {
        scores[0] = 0.8;
    }

    let headers = RE_HEADER_LINE.find_iter(markdown).count();
    if headers < 2 && total_chars > 500 {
        issues.push("Lack of document structure (few headers)".to_string());
        scores[1] = 0.5;
    } else {
        scores[1] = 0.9;
    }

    let lines: Vec<&str> = markdown.split('\n').collect();
    let empty = lines.iter().filter(|l| l.trim().is_empty()).count();
    let empty_ratio = empty as f64 / lines.len() as f64;
    if empty_ratio > 0.4 {
        issues.push(format!("Excessive empty lines ({:.2} ratio)", empty_ratio));
        scores[2] = 0.6;
    } else {
        scores[2] = 0.9;
    }

    QualityScore {
        score: (scores.iter().sum::<f64>() / scores.len() as f64).clamp(0.0, 1.0),
        issues,
    }
}

// ── LLM page cleanup ─────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\n(.*)\n```\s*$").unwrap());
static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

/// Tidy one page of vision-model output.
///
/// Models sometimes wrap the page in a ```` ```markdown ```` fence, emit
/// zero-width characters, or invent image links for figures they cannot
/// transcribe. Invented links become an italic caption so the description
/// survives.
pub fn clean_llm_page(raw: &str) -> String {
    let trimmed = raw.trim();
    let unfenced = match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    };
    let s = normalise_line_endings(&unfenced).replace(['\u{200B}', '\u{FEFF}', '\u{200C}', '\u{200D}', '\u{2060}'], "");

    RE_IMAGE
        .replace_all(&s, |caps: &regex::Captures<'_>| {
            let alt = caps[1].trim();
            let url = caps[2].trim();
            if url.starts_with("http://") || url.starts_with("https://") {
                caps[0].to_string()
            } else if alt.is_empty() {
                String::new()
            } else {
                format!("*{}*", alt)
            }
        })
        .trim()
        .to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_scenario_fixes_confusions_and_newlines() {
        let out = post_process("Section  l\n\n\n\nMore", true);
        assert!(out.contains("Section 1"), "got: {out:?}");
        assert!(!out.contains("\n\n\n"), "got: {out:?}");
    }

    #[test]
    fn confusions_are_left_alone_for_direct_text() {
        let out = post_process("Form l and O", false);
        assert_eq!(out, "Form l and O");
    }

    #[test]
    fn ocr_only_replaces_whole_words() {
        let out = post_process("lOl l O Oslo", true);
        assert_eq!(out, "lOl 1 0 Oslo");
    }

    #[test]
    fn soft_hyphens_always_removed() {
        assert_eq!(post_process("co\u{00AD}operate", false), "cooperate");
    }

    #[test]
    fn headers_get_surrounding_blank_lines() {
        let out = post_process("intro\n## Page 1\nbody", false);
        assert_eq!(out, "intro\n\n## Page 1\n\nbody");
    }

    #[test]
    fn consecutive_headers_are_separated() {
        let out = post_process("# Doc\n## Page 1\ntext", false);
        assert_eq!(out, "# Doc\n\n## Page 1\n\ntext");
    }

    #[test]
    fn headers_inside_fences_untouched() {
        let input = "```\n# not a header\ncode\n```";
        assert_eq!(post_process(input, false), input);
    }

    #[test]
    fn list_markers_normalised_and_separated() {
        let out = post_process("-   one\n*\ttwo\n1.  three\nafter", false);
        assert_eq!(out, "- one\n* two\n1. three\n\nafter");
    }

    #[test]
    fn list_continuation_lines_stay_attached() {
        let out = post_process("- item\n  continued", false);
        assert_eq!(out, "- item\n  continued");
    }

    #[test]
    fn whitespace_only_passthrough() {
        assert_eq!(post_process("  \n ", true), "  \n ");
    }

    #[test]
    fn empty_quality_is_zero() {
        let q = validate_quality("");
        assert_eq!(q.score, 0.0);
        assert_eq!(q.issues, vec!["Empty content".to_string()]);
    }

    #[test]
    fn clean_document_scores_high() {
        let md = "# Title\n\n## Section\n\nPlain readable text, nothing odd.\nSecond line.";
        let q = validate_quality(md);
        assert!((q.score - (0.8 + 0.9 + 0.9) / 3.0).abs() < 1e-9);
        assert!(q.issues.is_empty());
    }

    #[test]
    fn garbled_text_is_penalised() {
        let md = "§§§§ ¤¤¤¤ ¶¶¶¶ text";
        let q = validate_quality(md);
        assert!(q.issues.iter().any(|i| i.starts_with("High ratio of garbled")));
        assert!(q.score < 0.8);
    }

    #[test]
    fn long_unstructured_text_is_penalised() {
        let md = "word ".repeat(200);
        let q = validate_quality(&md);
        assert!(q.issues.contains(&"Lack of document structure (few headers)".to_string()));
    }

    #[test]
    fn sparse_text_is_penalised() {
        let q = validate_quality("a\n\n\n\nb");
        assert!(q.issues.iter().any(|i| i.starts_with("Excessive empty lines")));
    }

    #[test]
    fn score_always_bounded() {
        for md in ["x", "§", "\n\n\n", "# a\n# b", &"¤".repeat(1000)] {
            let q = validate_quality(md);
            assert!((0.0..=1.0).contains(&q.score), "{md:?} → {}", q.score);
        }
    }

    #[test]
    fn llm_page_fences_stripped() {
        assert_eq!(clean_llm_page("```markdown\n# Memo\nText\n```"), "# Memo\nText");
    }

    #[test]
    fn llm_placeholder_images_become_captions() {
        let out = clean_llm_page("![Seal of the agency](seal.png)\nBody");
        assert_eq!(out, "*Seal of the agency*\nBody");
        let keep = clean_llm_page("![Map](https://archives.example/map.png)");
        assert!(keep.starts_with("![Map]"));
    }

    #[test]
    fn llm_invisible_chars_removed() {
        assert_eq!(clean_llm_page("a\u{200B}b\u{FEFF}c"), "abc");
    }
}
