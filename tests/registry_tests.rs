//! Registry behavior: concurrent lookup, and the teardown sequence when a
//! server is dropped (environment destroyed, then the bus, then the handles).

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use roost::environment::{ExitState, ProcessEnvironment};
use roost::error::Result;
use roost::remote::ServerConfiguration;
use roost::server::state::StateStore;
use roost::server::{ProcessState, Server, ServerRegistry, CONSOLE_OUTPUT_EVENT};

struct NullEnvironment {
    state: Arc<StateStore>,
    destroyed: AtomicBool,
}

#[async_trait]
impl ProcessEnvironment for NullEnvironment {
    fn kind(&self) -> &'static str {
        "null"
    }

    async fn exists(&self) -> Result<bool> {
        Ok(false)
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(false)
    }

    async fn create(&self, _invocation: &str) -> Result<()> {
        Ok(())
    }

    async fn on_before_start(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.state.set(ProcessState::Starting);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_for_stop(&self, _seconds: u64, _terminate: bool) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self, _signal: &str) -> Result<()> {
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        Ok(())
    }

    async fn in_situ_update(&self) -> Result<()> {
        Ok(())
    }

    async fn send_command(&self, _command: &str) -> Result<()> {
        Ok(())
    }

    async fn read_log(&self, _bytes: u64) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn exit_state(&self) -> Result<ExitState> {
        Ok(ExitState::default())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::Release);
        Ok(())
    }

    async fn attach(&self) -> Result<()> {
        Ok(())
    }
}

fn build_server() -> (Arc<Server>, Arc<NullEnvironment>) {
    let uuid = Uuid::new_v4();
    let configuration: ServerConfiguration = serde_json::from_value(serde_json::json!({
        "settings": {
            "uuid": uuid,
            "invocation": "./start.sh",
            "build": { "memory": 256, "disk": 0 },
            "container": { "image": "alpine:3" },
            "allocations": {
                "default": { "ip": "0.0.0.0", "port": 7777 },
                "mappings": { "0.0.0.0": [7777] }
            }
        },
        "process_configuration": {
            "stop": { "type": "signal", "value": "SIGKILL" }
        }
    }))
    .unwrap();

    let holder: Arc<OnceLock<Arc<NullEnvironment>>> = Arc::new(OnceLock::new());
    let captured = holder.clone();

    let server = Server::build(configuration, move |parts| {
        let env = Arc::new(NullEnvironment {
            state: parts.state,
            destroyed: AtomicBool::new(false),
        });
        let _ = captured.set(env.clone());
        Ok(env as Arc<dyn ProcessEnvironment>)
    })
    .unwrap();

    let env = holder.get().unwrap().clone();
    (server, env)
}

#[tokio::test]
async fn add_and_get_servers() {
    let registry = ServerRegistry::new();
    assert!(registry.is_empty().await);

    let (server, _env) = build_server();
    let id = server.id();

    registry.add(server).await;
    assert_eq!(registry.len().await, 1);
    assert!(registry.get(id).await.is_some());
    assert!(registry.get(Uuid::new_v4()).await.is_none());
}

#[tokio::test]
async fn concurrent_lookups_share_the_same_server() {
    let registry = Arc::new(ServerRegistry::new());
    let (server, _env) = build_server();
    let id = server.id();
    registry.add(server).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.get(id).await.map(|s| s.id())
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Some(id));
    }
}

#[tokio::test]
async fn remove_destroys_environment_and_bus() {
    let registry = ServerRegistry::new();
    let (server, env) = build_server();
    let id = server.id();
    let events = server.events().clone();
    registry.add(server).await;

    registry.remove(id).await.unwrap();

    assert!(env.destroyed.load(Ordering::Acquire));
    assert!(registry.get(id).await.is_none());
    assert!(events.subscribe(CONSOLE_OUTPUT_EVENT).is_err());
}

#[tokio::test]
async fn remove_unknown_server_is_a_no_op() {
    let registry = ServerRegistry::new();
    registry.remove(Uuid::new_v4()).await.unwrap();
}

#[tokio::test]
async fn validation_rejects_a_default_allocation_missing_from_mappings() {
    let configuration: ServerConfiguration = serde_json::from_value(serde_json::json!({
        "settings": {
            "uuid": Uuid::new_v4(),
            "build": { "memory": 256 },
            "container": { "image": "alpine:3" },
            "allocations": {
                "default": { "ip": "0.0.0.0", "port": 7777 },
                "mappings": { "0.0.0.0": [25565] }
            }
        }
    }))
    .unwrap();

    let result = Server::build(configuration, |_parts| unreachable!("factory must not run"));
    assert!(result.is_err());
}
