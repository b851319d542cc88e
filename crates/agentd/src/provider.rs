//! Provider wiring for the standalone binary.
//!
//! Real provider adapters (HTTP clients, SDKs) live outside this
//! repository and are linked in by the embedding server. The binary only
//! knows how to wire the scripted replay provider, selected through
//! `STRAND_PROVIDER=scripted:<path>` — a JSON file holding one event script
//! per expected provider call.

use std::sync::Arc;

use strand_domain::error::{Error, Result};
use strand_domain::provider::Provider;
use strand_domain::stream::ProviderEvent;
use strand_runtime::testing::{ScriptItem, ScriptedProvider};

pub fn from_env() -> Result<Arc<dyn Provider>> {
    let spec = std::env::var("STRAND_PROVIDER").map_err(|_| {
        Error::Config(
            "STRAND_PROVIDER is not set; this binary ships no network providers".into(),
        )
    })?;
    from_spec(&spec)
}

fn from_spec(spec: &str) -> Result<Arc<dyn Provider>> {
    match spec.split_once(':') {
        Some(("scripted", path)) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("reading provider script {path}: {e}")))?;
            let scripts: Vec<Vec<ProviderEvent>> = serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("parsing provider script {path}: {e}")))?;
            let scripts = scripts
                .into_iter()
                .map(|script| script.into_iter().map(ScriptItem::from).collect())
                .collect();
            Ok(Arc::new(ScriptedProvider::new(scripts)))
        }
        _ => Err(Error::Config(format!(
            "unknown provider spec '{spec}' (expected scripted:<path>)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_provider_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.json");
        std::fs::write(
            &path,
            r#"[[
                {"type": "turn_start", "turn": 1},
                {"type": "text_delta", "text": "hi"},
                {"type": "turn_end", "turn": 1, "duration_ms": 5, "usage": {}}
            ]]"#,
        )
        .unwrap();

        let provider = from_spec(&format!("scripted:{}", path.display())).unwrap();
        assert_eq!(provider.provider_id(), "scripted");
    }

    #[test]
    fn unknown_spec_is_config_error() {
        let err = from_spec("carrier-pigeon").err().unwrap();
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn malformed_script_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let err = from_spec(&format!("scripted:{}", path.display())).err().unwrap();
        assert_eq!(err.code(), "config");
    }
}
