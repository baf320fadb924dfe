pub mod agent;
pub mod bootstrap;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod formatter;
pub mod handler;
pub mod handlers;
pub mod pending;
pub mod persona;
pub mod planner;
pub mod prompts;
pub mod router;

pub use agent::*;
pub use bootstrap::*;
pub use classifier::*;
pub use config::*;
pub use dispatcher::*;
pub use formatter::*;
pub use handler::*;
pub use pending::*;
pub use persona::*;
pub use planner::*;
pub use router::*;

use serde_json::Value;

/// Pulls a JSON object out of a model reply: a ```json fence if present,
/// otherwise the span from the first `{` to the last `}`.
pub fn extract_json_block(raw: &str) -> Option<Value> {
    let fenced = raw.find("```json").and_then(|start| {
        let body = &raw[start + "```json".len()..];
        body.find("```").map(|end| &body[..end])
    });
    let candidate = match fenced {
        Some(body) => body.trim(),
        None => {
            let start = raw.find('{')?;
            let end = raw.rfind('}')?;
            if end < start {
                return None;
            }
            &raw[start..=end]
        }
    };
    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_and_bare_objects() {
        let fenced = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json_block(fenced).unwrap()["a"], 1);

        let bare = "noise {\"b\": {\"c\": 2}} trailing";
        assert_eq!(extract_json_block(bare).unwrap()["b"]["c"], 2);

        assert!(extract_json_block("no json here").is_none());
        assert!(extract_json_block("} backwards {").is_none());
        assert!(extract_json_block("[1, 2]").is_none());
    }
}
