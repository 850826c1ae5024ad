//! Prompts for vision-model page transcription.
//!
//! [`crate::config::ConversionConfig::system_prompt`] overrides
//! [`ARCHIVE_PAGE_PROMPT`] when set.

/// Default system prompt for transcribing one archival page image.
///
/// Archive scans are mostly typewritten memos, cables and forms with
/// stamps, redaction bars and handwritten annotations, so the rules lean
/// towards faithful transcription over layout reconstruction.
pub const ARCHIVE_PAGE_PROMPT: &str = r#"You are transcribing a scanned archival document page into Markdown.

Rules:

1. TEXT
   - Transcribe ALL legible text exactly as written, in reading order
   - Keep original spelling, capitalisation and abbreviations
   - Mark text you cannot read as [illegible]
   - Mark blacked-out or redacted passages as [redacted]

2. STRUCTURE
   - Use ### for headings printed in capitals (MEMORANDUM, SUBJECT, etc.)
   - Keep form labels with their values on one line, e.g. "TO: Director"
   - Use - for lists and GFM pipe tables for tabular content

3. MARKINGS
   - Transcribe classification stamps (SECRET, CONFIDENTIAL, ...) on their own line
   - Wrap handwritten notes in *italics*

4. OUTPUT
   - Output ONLY the Markdown content
   - Do NOT wrap the output in ```markdown fences
   - Do NOT add commentary, summaries or page markers"#;

/// Short user-turn text that accompanies the page image.
pub fn page_instruction(page_num: usize, total_pages: usize) -> String {
    format!("Page {} of {}.", page_num, total_pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_mentions_redactions() {
        assert!(ARCHIVE_PAGE_PROMPT.contains("[redacted]"));
        assert!(ARCHIVE_PAGE_PROMPT.contains("Output ONLY"));
    }

    #[test]
    fn instruction_numbers_pages() {
        assert_eq!(page_instruction(2, 7), "Page 2 of 7.");
    }
}
