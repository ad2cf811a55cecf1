//! Extraction prompt shared by every LLM-backed provider.

use crate::schema::ExtractionRequest;

const EXTRACTION_INSTRUCTIONS: &str = r#"You extract structured event data from images and OCR text.

Return ONLY a JSON object, no prose and no markdown. Use these fields when present:
- "title": short name of the event or document
- "date": ISO 8601 date (YYYY-MM-DD)
- "start_time" / "end_time": 24h "HH:MM"
- "location": venue or address
- "description": one or two sentences
Add any other salient fields (price, organizer, contact, ...) as extra keys.
Resolve relative dates ("tomorrow", "next Friday") against today's date.
Use null for fields you cannot determine."#;

/// Build the user prompt for `request`. `options.system_prompt` replaces the
/// default instructions.
pub fn build_prompt(request: &ExtractionRequest) -> String {
    let instructions = request
        .options
        .get("system_prompt")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(EXTRACTION_INSTRUCTIONS);

    let mut prompt = String::from(instructions);

    if let Some(today) = &request.today_date {
        prompt.push_str(&format!("\n\nToday's date: {}", today));
    }
    if let Some(context) = &request.image_context {
        prompt.push_str(&format!("\n\nContext: {}", context));
    }
    if let Some(text) = &request.ocr_text {
        prompt.push_str("\n\n## OCR text\n\n");
        prompt.push_str(text);
    }
    if request.has_image() {
        prompt.push_str("\n\nThe image is attached.");
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_includes_context() {
        let request = ExtractionRequest {
            ocr_text: Some("Jazz night, Fri 8pm".into()),
            image_context: Some("poster on a cafe door".into()),
            today_date: Some("2026-10-16".into()),
            ..Default::default()
        };
        let prompt = build_prompt(&request);
        assert!(prompt.starts_with("You extract structured event data"));
        assert!(prompt.contains("Today's date: 2026-10-16"));
        assert!(prompt.contains("Context: poster on a cafe door"));
        assert!(prompt.contains("## OCR text\n\nJazz night, Fri 8pm"));
        assert!(!prompt.contains("attached"));
    }

    #[test]
    fn test_system_prompt_override() {
        let mut request = ExtractionRequest {
            ocr_text: Some("Total 12.00".into()),
            ..Default::default()
        };
        request
            .options
            .insert("system_prompt".into(), json!("Return the receipt total as JSON."));
        let prompt = build_prompt(&request);
        assert!(prompt.starts_with("Return the receipt total as JSON."));
        assert!(!prompt.contains("structured event data"));
    }
}
