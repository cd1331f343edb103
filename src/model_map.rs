use crate::config::ModelMapEntry;
use std::collections::HashMap;

/// Static external/backend model-name mapping. Unmapped names pass through
/// unchanged in both directions.
pub struct ModelMapper {
    to_backend: HashMap<String, String>,
    to_external: HashMap<String, String>,
}

impl ModelMapper {
    pub fn from_entries(entries: &[ModelMapEntry]) -> Self {
        let mut to_backend = HashMap::new();
        let mut to_external = HashMap::new();
        for entry in entries {
            to_backend.insert(entry.external_model.clone(), entry.backend_model.clone());
            to_external.insert(entry.backend_model.clone(), entry.external_model.clone());
        }
        Self {
            to_backend,
            to_external,
        }
    }

    pub fn to_backend_name(&self, external: &str) -> String {
        self.to_backend
            .get(external)
            .cloned()
            .unwrap_or_else(|| external.to_string())
    }

    pub fn to_external_name(&self, backend: &str) -> String {
        self.to_external
            .get(backend)
            .cloned()
            .unwrap_or_else(|| backend.to_string())
    }

    pub fn external_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.to_backend.keys().cloned().collect();
        models.sort();
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> ModelMapper {
        ModelMapper::from_entries(&[
            ModelMapEntry {
                external_model: "gpt-4o".to_string(),
                backend_model: "prime-v2".to_string(),
            },
            ModelMapEntry {
                external_model: "gpt-4o-mini".to_string(),
                backend_model: "prime-lite".to_string(),
            },
        ])
    }

    #[test]
    fn maps_both_directions() {
        let mapper = mapper();
        assert_eq!(mapper.to_backend_name("gpt-4o"), "prime-v2");
        assert_eq!(mapper.to_external_name("prime-lite"), "gpt-4o-mini");
    }

    #[test]
    fn unmapped_names_pass_through() {
        let mapper = mapper();
        assert_eq!(mapper.to_backend_name("unknown"), "unknown");
        assert_eq!(mapper.to_external_name("unknown"), "unknown");
    }

    #[test]
    fn external_models_are_sorted() {
        assert_eq!(
            mapper().external_models(),
            vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]
        );
    }
}
