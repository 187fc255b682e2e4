//! Per-engine package requirements

use inferlet_core::{CudaVersion, Engine};
use std::collections::BTreeMap;

/// A pinned package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub version: String,
}

impl Requirement {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

const TRT_REQUIREMENTS: &[(&str, &str)] = &[
    ("torch", "2.9.1"),
    ("tensorrt_llm", "1.2.0"),
    ("nvidia-modelopt", "0.37.0"),
    ("transformers", "4.57.1"),
];

const VLLM_REQUIREMENTS: &[(&str, &str)] = &[
    ("torch", "2.9.0"),
    ("vllm", "0.11.2"),
    ("flashinfer-python", "0.5.2"),
    ("transformers", "4.57.1"),
];

/// Requirements for `engine`, with `pins[engine]` overriding or extending the
/// defaults. Order is install order.
pub fn requirements_for(
    engine: Engine,
    pins: &BTreeMap<String, BTreeMap<String, String>>,
) -> Vec<Requirement> {
    let defaults = match engine {
        Engine::Trt => TRT_REQUIREMENTS,
        Engine::Vllm => VLLM_REQUIREMENTS,
    };
    let mut requirements: Vec<Requirement> = defaults
        .iter()
        .map(|(name, version)| Requirement::new(*name, *version))
        .collect();

    if let Some(overrides) = pins.get(engine.as_str()) {
        for (name, version) in overrides {
            match requirements.iter_mut().find(|r| &r.name == name) {
                Some(existing) => existing.version = version.clone(),
                None => requirements.push(Requirement::new(name.clone(), version.clone())),
            }
        }
    }

    requirements
}

/// Extra index serving torch wheels built for `toolkit`
pub fn torch_index_url(toolkit: CudaVersion) -> String {
    format!("https://download.pytorch.org/whl/{}", toolkit.wheel_tag())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engines_have_distinct_manifests() {
        let pins = BTreeMap::new();
        let trt = requirements_for(Engine::Trt, &pins);
        let vllm = requirements_for(Engine::Vllm, &pins);
        assert!(trt.iter().any(|r| r.name == "tensorrt_llm"));
        assert!(!vllm.iter().any(|r| r.name == "tensorrt_llm"));
        assert_eq!(trt[0].name, "torch");
    }

    #[test]
    fn test_pins_override_and_extend() {
        let mut vllm_pins = BTreeMap::new();
        vllm_pins.insert("vllm".to_string(), "0.12.0".to_string());
        vllm_pins.insert("xformers".to_string(), "0.0.32".to_string());
        let mut pins = BTreeMap::new();
        pins.insert("vllm".to_string(), vllm_pins);

        let reqs = requirements_for(Engine::Vllm, &pins);
        let vllm = reqs.iter().find(|r| r.name == "vllm").unwrap();
        assert_eq!(vllm.version, "0.12.0");
        assert_eq!(reqs.last().unwrap().name, "xformers");

        // pins for another engine do not leak
        let trt = requirements_for(Engine::Trt, &pins);
        assert!(!trt.iter().any(|r| r.name == "xformers"));
    }

    #[test]
    fn test_torch_index_url() {
        assert_eq!(
            torch_index_url(CudaVersion::new(13, 0)),
            "https://download.pytorch.org/whl/cu130"
        );
    }
}
