use std::fmt::Write;

use serde_json::Value;

use crate::types::Content;

fn language_for_mime(mime: &str) -> &'static str {
    match mime {
        "text/x-go" | "text/golang" => "go",
        "text/x-rust" => "rust",
        "application/json" => "json",
        "text/javascript" => "javascript",
        "text/html" => "html",
        "text/css" => "css",
        _ => "text",
    }
}

fn pretty_json(raw: &str) -> String {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| raw.to_string())
}

/// Markdown snapshot of a content list, as pushed to live observers.
pub fn render_markdown(contents: &[Content]) -> String {
    let mut out = String::new();
    for content in contents {
        match content {
            Content::Text { text } => out.push_str(text),
            Content::Resource { resources } => {
                for resource in resources {
                    out.push_str("  \n\n<details>\n");
                    let _ = write!(out, "<summary>Resource: {}</summary>\n\n", resource.uri);
                    let mime = resource.mime();
                    if !mime.is_empty() {
                        let _ = write!(out, "MIME Type: `{mime}`\n\n");
                    }
                    match (&resource.text, &resource.blob) {
                        (Some(text), _) if !text.is_empty() => {
                            let _ = writeln!(out, "```{}\n{text}\n```", language_for_mime(mime));
                        }
                        (_, Some(blob)) if resource.is_image() => {
                            let _ = writeln!(
                                out,
                                "<img src=\"data:{mime};base64,{blob}\" alt=\"{}\" />",
                                resource.uri
                            );
                        }
                        (_, Some(blob)) => {
                            let _ = writeln!(
                                out,
                                "<a href=\"data:{mime};base64,{blob}\" download=\"{uri}\">Download {uri}</a>",
                                uri = resource.uri
                            );
                        }
                        _ => {}
                    }
                    out.push_str("\n</details>  \n\n");
                }
            }
            Content::ToolCall {
                name, arguments, ..
            } => {
                out.push_str("  \n\n<details>\n");
                let _ = write!(out, "<summary>Calling Tool: {name}</summary>\n\n");
                out.push_str("Input:\n");
                let _ = writeln!(out, "```json\n{}\n```", pretty_json(arguments));
            }
            Content::ToolResult { result, .. } => {
                out.push_str("\n\nResult:\n");
                let _ = writeln!(out, "```json\n{}\n```", pretty_json(result));
                out.push_str("\n</details>  \n\n");
            }
        }
    }
    out
}
