// Common test utilities for integration tests

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use serde_json::json;

/// Get a Kubernetes client or skip the test if not in a cluster
pub async fn get_kube_client_or_skip() -> Option<Client> {
    match Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            eprintln!("Skipping integration test: not running in Kubernetes cluster: {e}");
            None
        }
    }
}

/// Create a throwaway Node object for exercising coordination writes
pub async fn create_test_node(
    client: &Client,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let nodes: Api<Node> = Api::all(client.clone());

    let node = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": {
            "name": name,
            "labels": {
                "test": "integration",
                "managed-by": "klocksmith-test"
            }
        }
    }))?;

    match nodes.create(&PostParams::default(), &node).await {
        Ok(_) => {
            println!("Created test node: {name}");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            println!("Test node already exists: {name}");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}

/// Cleanup test node
pub async fn cleanup_test_node(
    client: &Client,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let nodes: Api<Node> = Api::all(client.clone());

    match nodes.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            println!("Deleted test node: {name}");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Box::new(e)),
    }
}
