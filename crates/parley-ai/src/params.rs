use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Provider-agnostic sampling knobs. `None` means "let the provider decide";
/// adapters omit unset fields from the wire entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterSet {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub min_p: Option<f32>,
    pub top_a: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub repetition_penalty: Option<f32>,
    pub seed: Option<i64>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub logit_bias: Option<BTreeMap<String, i32>>,
    pub logprobs: Option<bool>,
    pub top_logprobs: Option<u32>,
    pub include_reasoning: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_stay_unset() {
        let params: ParameterSet =
            serde_json::from_str(r#"{"temperature":0.2,"stop":["END"]}"#).expect("params");
        assert_eq!(params.temperature, Some(0.2));
        assert_eq!(params.stop, Some(vec!["END".to_string()]));
        assert_eq!(params.top_k, None);
        assert_eq!(params.logit_bias, None);
    }
}
