//! Image pulls with a dedup cache scoped to one provisioning run.

use std::collections::HashSet;

use tracing::debug;
use ws_core::{CancellationToken, ContainerRegistry, LogWriter, Result};

use crate::runtime::ContainerRuntime;

/// Pulls images, skipping references already pulled (or built) in this run.
///
/// A new puller is created for every run, so a later run always re-pulls and
/// picks up a moved tag such as `latest`.
pub struct ImagePuller<'a> {
    runtime: &'a dyn ContainerRuntime,
    registries: &'a [ContainerRegistry],
    log: &'a LogWriter,
    pulled: HashSet<String>,
}

impl<'a> ImagePuller<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        registries: &'a [ContainerRegistry],
        log: &'a LogWriter,
    ) -> Self {
        Self {
            runtime,
            registries,
            log,
            pulled: HashSet::new(),
        }
    }

    /// Pull `image` unless it was already pulled in this run. Returns whether a pull happened.
    pub async fn pull(&mut self, image: &str, cancel: &CancellationToken) -> Result<bool> {
        if self.pulled.contains(image) {
            debug!("Image {} already pulled in this run", image);
            return Ok(false);
        }
        let registry = ContainerRegistry::for_image(self.registries, image);
        self.runtime
            .pull_image(image, registry, self.log, cancel)
            .await?;
        self.pulled.insert(image.to_string());
        Ok(true)
    }

    /// Record an image produced locally so it is never pulled.
    pub fn mark_available(&mut self, image: &str) {
        self.pulled.insert(image.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRuntime;

    #[tokio::test]
    async fn test_same_image_pulled_once_per_run() {
        let runtime = MockRuntime::new();
        let log = LogWriter::sink();
        let cancel = CancellationToken::new();
        let mut puller = ImagePuller::new(&runtime, &[], &log);

        assert!(puller.pull("builder:latest", &cancel).await.unwrap());
        assert!(!puller.pull("builder:latest", &cancel).await.unwrap());
        assert!(puller.pull("other:1", &cancel).await.unwrap());

        assert_eq!(runtime.pulls(), vec!["builder:latest", "other:1"]);
    }

    #[tokio::test]
    async fn test_new_run_pulls_again() {
        let runtime = MockRuntime::new();
        let log = LogWriter::sink();
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let mut puller = ImagePuller::new(&runtime, &[], &log);
            puller.pull("builder:latest", &cancel).await.unwrap();
        }

        assert_eq!(runtime.pulls().len(), 2);
    }

    #[tokio::test]
    async fn test_registry_selected_by_image_host() {
        let runtime = MockRuntime::new();
        let log = LogWriter::sink();
        let registries = vec![ContainerRegistry {
            server: "ghcr.io".into(),
            username: "bot".into(),
            password: "token".into(),
        }];
        let mut puller = ImagePuller::new(&runtime, &registries, &log);

        puller
            .pull("ghcr.io/acme/builder:1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            runtime.calls()[0],
            crate::mock::RuntimeCall::Pull {
                image: "ghcr.io/acme/builder:1".into(),
                registry: Some("ghcr.io".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_built_image_never_pulled() {
        let runtime = MockRuntime::new();
        let log = LogWriter::sink();
        let mut puller = ImagePuller::new(&runtime, &[], &log);

        puller.mark_available("ws-1:latest");
        assert!(!puller
            .pull("ws-1:latest", &CancellationToken::new())
            .await
            .unwrap());
        assert!(runtime.pulls().is_empty());
    }
}
