//! Executor image and pull registry resolution.

use shipyard_core::infra::ImageResolver;
use shipyard_core::job::RegistryNamespace;

/// `image_from` value meaning "the build OS field is a full image reference".
pub const CUSTOM_IMAGE: &str = "custom";

pub struct DefaultImageResolver {
    base_registry: String,
}

impl DefaultImageResolver {
    pub fn new(base_registry: impl Into<String>) -> Self {
        Self {
            base_registry: base_registry.into(),
        }
    }
}

impl ImageResolver for DefaultImageResolver {
    fn base_image(&self, build_os: &str, image_from: &str) -> String {
        if image_from == CUSTOM_IMAGE {
            return build_os.to_string();
        }
        format!(
            "{}/build-base:{}",
            self.base_registry.trim_end_matches('/'),
            build_os
        )
    }

    fn matched_registries(
        &self,
        image: &str,
        registries: &[RegistryNamespace],
    ) -> Vec<RegistryNamespace> {
        registries
            .iter()
            .filter(|r| {
                let prefix = r.image_prefix();
                !prefix.is_empty() && image.starts_with(&prefix)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(addr: &str, namespace: &str) -> RegistryNamespace {
        RegistryNamespace {
            reg_addr: addr.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_base_image() {
        let resolver = DefaultImageResolver::new("registry.example.com/shipyard/");
        assert_eq!(
            resolver.base_image("focal", ""),
            "registry.example.com/shipyard/build-base:focal"
        );
        assert_eq!(
            resolver.base_image("ghcr.io/acme/builder:2", CUSTOM_IMAGE),
            "ghcr.io/acme/builder:2"
        );
    }

    #[test]
    fn test_matched_registries_by_prefix() {
        let resolver = DefaultImageResolver::new("registry.example.com/shipyard");
        let registries = vec![
            registry("https://ghcr.io", "acme"),
            registry("https://ghcr.io", "other"),
            registry("http://registry.example.com", ""),
            registry("", ""),
        ];

        let matched = resolver.matched_registries("ghcr.io/acme/builder:2", &registries);
        assert_eq!(matched, vec![registry("https://ghcr.io", "acme")]);

        let matched = resolver.matched_registries("registry.example.com/shipyard/build-base:focal", &registries);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].reg_addr, "http://registry.example.com");
    }
}
