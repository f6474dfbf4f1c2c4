// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for the Redis live bus.

use event_replicator::BusConfig;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Start a Redis container.
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));

    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// Bus config pointed at a container, on a topic unique to the test.
pub fn bus_config(container: &Container<'_, GenericImage>, topic: &str) -> BusConfig {
    BusConfig {
        redis_url: redis_url(container),
        topic: format!("{}-{}", topic, uuid::Uuid::new_v4()),
        block_timeout: "100ms".to_string(),
        ..Default::default()
    }
}
