use redis::aio::ConnectionManager;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};

use hermes_core::job::{CreateJobRequest, Job};

/// Spins up a Redis container and returns a connected client and manager.
///
/// The `ContainerAsync` must be kept in scope for the test duration —
/// dropping it will stop the container.
pub async fn setup_redis() -> (redis::Client, ConnectionManager, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("redis", "7")
        .with_exposed_port(ContainerPort::Tcp(6379))
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
        .expect("Failed to start Redis container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get port");

    let client =
        redis::Client::open(format!("redis://{host}:{port}")).expect("Failed to open client");

    // Retry connection until container is fully ready
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let manager = loop {
        match client.get_connection_manager().await {
            Ok(manager) => break manager,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to Redis after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    (client, manager, container)
}

pub fn test_job(user: &str, host: &str, query: serde_json::Value) -> Job {
    Job::create(CreateJobRequest::new(user, host, query)).expect("valid query")
}
