//! Prompts sent alongside each page image.
//!
//! Callers supply their own instruction per run; the constants here are the
//! defaults used by the CLI and by [`crate::pipeline::extract::ExtractionClient::extract_structured`].

/// Default free-form instruction when the caller does not provide one.
pub const DEFAULT_ANALYSIS_PROMPT: &str =
    "Analyse this image and extract the important information it contains.";

/// The JSON layout requested by [`structured_prompt`].
///
/// Keys match the table columns in [`crate::pipeline::aggregate::COLUMNS`].
pub const STRUCTURED_FORMAT: &str = r#"{
    "type_document": "string",
    "date": "YYYY-MM-DD",
    "montant": "number",
    "devise": "string",
    "emetteur": "string",
    "destinataire": "string",
    "numero_document": "string",
    "autres_informations": {}
}"#;

/// Wrap a caller instruction with the canonical structured-extraction request.
pub fn structured_prompt(instruction: &str) -> String {
    format!(
        "{}\n\nRespond with a single JSON object containing the extracted information.\n\
Dates must use ISO-8601 (YYYY-MM-DD). Put any other relevant fields in \"autres_informations\".\n\
Expected format:\n{}",
        instruction.trim(),
        STRUCTURED_FORMAT
    )
}
