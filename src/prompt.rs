//! Prompt text sent to the completion model.

use crate::markdown;
use crate::models::{ChatTurn, ContextBlob, ContextSource, DocumentContent, VectorHit};

/// Context used when retrieval degraded and nothing could be included.
pub const PLACEHOLDER_CONTEXT: &str =
    "# Your Vault\n\nNo relevant context found, but I can still help!";

pub const SYSTEM_PROMPT: &str = "You are an assistant that helps people connect scattered information across their markdown notes vault.

Your job:
1. Read and understand the markdown files provided as context
2. Find connections between notes that are easy to miss
3. Answer questions about the collected information accurately
4. Turn scattered notes into coherent insights

Guidelines:
- Treat all markdown files equally: product logs, feedback notes, loose thoughts
- Cite the markdown files you are referencing in your answer
- Use front-matter metadata (tags, dates) when it is available
- If the information across files is incomplete, say where the gaps are
- Be concise";

/// Wrap rendered context and the caller's question.
pub fn user_prompt(context: &str, query: &str) -> String {
    format!(
        "Here are the relevant markdown files from the vault:\n\n{}\n\nUser question: {}\n\nAnswer the question based on the markdown files above. Cite the specific file(s) you use. If you can't find relevant information, say so honestly.",
        context, query
    )
}

/// One section per document: path, modification time, tags, body.
pub fn format_documents(docs: &[DocumentContent]) -> String {
    docs.iter()
        .map(|doc| {
            let tags = markdown::tags(&doc.record.frontmatter);
            let tags = if tags.is_empty() {
                "none".to_string()
            } else {
                tags.join(", ")
            };
            format!(
                "## File: {}\n**Modified:** {}\n**Tags:** {}\n\n{}\n\n---",
                doc.record.relative_path,
                doc.record
                    .modified_at
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                tags,
                doc.full_text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Numbered excerpt list with section headings and similarity.
pub fn format_hits(hits: &[VectorHit]) -> String {
    let mut out = String::from("# Relevant Context from Your Vault\n\n");
    out.push_str(&format!("Found {} relevant sections:\n\n", hits.len()));
    for (idx, hit) in hits.iter().enumerate() {
        out.push_str(&format!("## [{}] {}\n", idx + 1, hit.file_path));
        out.push_str(&format!(
            "**Section:** {} ({:.1}% relevant)\n\n",
            hit.heading.as_deref().unwrap_or("Content"),
            hit.similarity * 100.0
        ));
        out.push_str(&hit.chunk_text);
        out.push_str("\n\n---\n\n");
    }
    out
}

/// Render a context blob into the text embedded in the user prompt.
///
/// A blob with nothing in it renders as [`PLACEHOLDER_CONTEXT`].
pub fn render(blob: &ContextBlob) -> String {
    if blob.is_empty() {
        return PLACEHOLDER_CONTEXT.to_string();
    }
    match blob.source {
        ContextSource::Selection | ContextSource::Lexical => format_documents(&blob.documents),
        ContextSource::Semantic => format_hits(&blob.hits),
        ContextSource::Placeholder => PLACEHOLDER_CONTEXT.to_string(),
    }
}

/// System and user messages for one request.
pub fn messages(blob: &ContextBlob, query: &str) -> Vec<ChatTurn> {
    vec![
        ChatTurn::system(SYSTEM_PROMPT),
        ChatTurn::user(user_prompt(&render(blob), query)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{encode_id, DocumentRecord, Frontmatter, Role};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn content(path: &str, body: &str, tags: Option<serde_json::Value>) -> DocumentContent {
        let mut frontmatter = Frontmatter::new();
        if let Some(tags) = tags {
            frontmatter.insert("tags".into(), tags);
        }
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        DocumentContent {
            record: DocumentRecord {
                id: encode_id(path),
                filename: path.trim_end_matches(".md").to_string(),
                relative_path: path.to_string(),
                size_bytes: body.len() as u64,
                modified_at: at,
                created_at: at,
                preview: String::new(),
                is_oversized: false,
                frontmatter,
            },
            full_text: body.to_string(),
        }
    }

    #[test]
    fn test_format_documents() {
        let docs = vec![
            content("a.md", "Alpha body\n", Some(json!(["bug", "mobile"]))),
            content("b.md", "Beta body", None),
        ];
        let text = format_documents(&docs);
        assert_eq!(
            text,
            "## File: a.md\n**Modified:** 2024-03-01T09:30:00.000Z\n**Tags:** bug, mobile\n\nAlpha body\n\n---\n\n## File: b.md\n**Modified:** 2024-03-01T09:30:00.000Z\n**Tags:** none\n\nBeta body\n\n---"
        );
    }

    #[test]
    fn test_format_hits() {
        let hits = vec![VectorHit {
            file_path: "logs/a.md".into(),
            chunk_index: 0,
            chunk_text: "Crash on launch".into(),
            heading: None,
            similarity: 0.8731,
        }];
        let text = format_hits(&hits);
        assert!(text.contains("Found 1 relevant sections"));
        assert!(text.contains("## [1] logs/a.md\n**Section:** Content (87.3% relevant)"));
        assert!(text.contains("Crash on launch\n\n---"));
    }

    #[test]
    fn test_placeholder_render() {
        let blob = ContextBlob::placeholder("vector search unavailable");
        assert_eq!(render(&blob), PLACEHOLDER_CONTEXT);
    }

    #[test]
    fn test_messages() {
        let blob = ContextBlob::placeholder("down");
        let turns = messages(&blob, "What changed?");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role(), Role::System);
        assert_eq!(turns[1].role(), Role::User);
        assert!(turns[1].content().contains("User question: What changed?"));
        assert!(turns[1].content().contains("No relevant context found"));
    }
}
