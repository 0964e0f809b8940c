//! Proxy manager against an in-memory store and loopback backends.


use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use cairn_events::ServerStatus;
use cairn_proxy::{
    JsonStore, ListenerRecord, ModulePort, ModuleRecord, PanelStore, ProxyError, ProxyKind,
    ProxyManager, ServerRecord, StaticResolver, StoreError,
};

use harness::{free_port, login_handshake, loopback_manager, HandshakeBackend, TcpEchoBackend};

const LOOPBACK: &str = "127.0.0.1";

struct Fixture {
    store: Arc<JsonStore>,
    resolver: Arc<StaticResolver>,
    manager: ProxyManager,
}

fn fixture() -> Fixture {
    let store = Arc::new(JsonStore::in_memory());
    let resolver = Arc::new(StaticResolver::new());
    let manager = loopback_manager(Arc::clone(&store), Arc::clone(&resolver));
    Fixture {
        store,
        resolver,
        manager,
    }
}

impl Fixture {
    fn container(&self, name: &str) {
        self.resolver
            .insert(name, LOOPBACK.parse::<IpAddr>().unwrap());
    }

    async fn listener(&self) -> ListenerRecord {
        let listener = ListenerRecord::new(free_port().await, "main");
        self.store.save_listener(listener.clone()).await.unwrap();
        listener
    }

    async fn server(
        &self,
        listener: &ListenerRecord,
        hostname: &str,
        status: ServerStatus,
        game_port: u16,
    ) -> ServerRecord {
        let mut server = ServerRecord::new(hostname);
        server.hostname = Some(hostname.to_string());
        server.listener_id = Some(listener.id);
        server.container_id = Some(format!("cairn-{}", server.id));
        server.status = status;
        server.game_port = game_port;
        self.container(server.container_id.as_deref().unwrap());
        self.store.save_server(server.clone()).await.unwrap();
        server
    }
}

fn module_port(listen_port: u16, backend_port: u16, protocol: &str) -> ModulePort {
    ModulePort {
        listen_port,
        backend_port,
        protocol: protocol.to_string(),
        hostname: None,
    }
}

#[tokio::test]
async fn test_start_routes_running_servers() {
    let fx = fixture();
    let (backend, mut seen) = HandshakeBackend::spawn("lobby").await.unwrap();
    let listener = fx.listener().await;
    let running = fx
        .server(&listener, "lobby.example.com", ServerStatus::Running, backend.addr.port())
        .await;
    fx.server(&listener, "idle.example.com", ServerStatus::Stopped, 25565)
        .await;

    fx.manager.start().await.unwrap();
    assert!(fx.manager.is_running().await);

    let routes = fx.manager.get_routes().await;
    let port_routes = &routes[&listener.port];
    assert_eq!(port_routes.kind, ProxyKind::Minecraft);
    assert_eq!(port_routes.listener_id, Some(listener.id));
    assert_eq!(port_routes.routes.len(), 1);
    let route = &port_routes.routes["lobby.example.com"];
    assert_eq!(route.owner_id, running.id.to_string());
    assert_eq!(route.backend_host, LOOPBACK);

    let mut client = TcpStream::connect((LOOPBACK, listener.port)).await.unwrap();
    client
        .write_all(&login_handshake("lobby.example.com").encode_frame())
        .await
        .unwrap();
    let handshake = timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handshake.server_address, "localhost");
    assert_eq!(handshake.server_port, backend.addr.port());

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let fx = fixture();
    let listener = fx.listener().await;
    fx.manager.start().await.unwrap();
    assert_eq!(fx.manager.ports().await, vec![listener.port]);

    fx.manager.stop().await;
    fx.manager.stop().await;
    assert!(!fx.manager.is_running().await);
    assert!(fx.manager.ports().await.is_empty());

    // Port released.
    tokio::net::TcpListener::bind((LOOPBACK, listener.port))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_add_listener_on_occupied_port() {
    let fx = fixture();
    let listener = ListenerRecord::new(free_port().await, "main");
    fx.manager.add_listener(&listener).await.unwrap();

    let instance = fx.manager.instance(listener.port).await.unwrap();
    instance.add_route("srv-1", "play.example.com", LOOPBACK, 25565);

    let intruder = ListenerRecord::new(listener.port, "other");
    let err = fx.manager.add_listener(&intruder).await.unwrap_err();
    assert!(matches!(err, ProxyError::PortInUse(p) if p == listener.port));

    let still = fx.manager.instance(listener.port).await.unwrap();
    assert!(Arc::ptr_eq(&instance, &still));
    assert!(still.is_running().await);
    assert_eq!(still.route_count(), 1);
    assert!(fx.store.listener(&intruder.id).await.unwrap().is_none());

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_remove_listener_in_use_is_refused() {
    let fx = fixture();
    let listener = fx.listener().await;
    fx.server(&listener, "lobby.example.com", ServerStatus::Stopped, 25565)
        .await;
    fx.manager.start().await.unwrap();

    let err = fx.manager.remove_listener(listener.port).await.unwrap_err();
    assert!(matches!(
        err,
        ProxyError::Store(StoreError::ListenerInUse { .. })
    ));
    assert!(fx.manager.instance(listener.port).await.is_some());

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_remove_listener_stops_instance() {
    let fx = fixture();
    let listener = ListenerRecord::new(free_port().await, "main");
    fx.manager.add_listener(&listener).await.unwrap();
    assert!(fx.store.listener(&listener.id).await.unwrap().is_some());

    fx.manager.remove_listener(listener.port).await.unwrap();
    assert!(fx.manager.instance(listener.port).await.is_none());
    assert!(fx.store.listener(&listener.id).await.unwrap().is_none());

    let err = fx.manager.remove_listener(listener.port).await.unwrap_err();
    assert!(matches!(err, ProxyError::PortNotFound(_)));
}

#[tokio::test]
async fn test_remove_disabled_listener() {
    let fx = fixture();
    let mut listener = ListenerRecord::new(free_port().await, "spare");
    listener.enabled = false;
    fx.manager.add_listener(&listener).await.unwrap();
    assert!(fx.manager.instance(listener.port).await.is_none());
    assert!(fx.store.listener(&listener.id).await.unwrap().is_some());

    fx.manager.remove_listener(listener.port).await.unwrap();
    assert!(fx.store.listener(&listener.id).await.unwrap().is_none());

    let err = fx.manager.remove_listener(listener.port).await.unwrap_err();
    assert!(matches!(err, ProxyError::PortNotFound(p) if p == listener.port));
}

#[tokio::test]
async fn test_server_route_follows_status() {
    let fx = fixture();
    let listener = fx.listener().await;
    let mut server = fx
        .server(&listener, "lobby.example.com", ServerStatus::Stopped, 25565)
        .await;
    fx.manager.start().await.unwrap();
    let instance = fx.manager.instance(listener.port).await.unwrap();
    assert_eq!(instance.route_count(), 0);

    server.status = ServerStatus::Starting;
    fx.manager.update_server_route(&server).await.unwrap();
    assert_eq!(instance.route_count(), 1);

    // A second update repoints instead of duplicating.
    server.status = ServerStatus::Running;
    server.game_port = 25570;
    fx.manager.update_server_route(&server).await.unwrap();
    let routes = instance.get_routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes["lobby.example.com"].backend_port, 25570);

    server.status = ServerStatus::Stopping;
    fx.manager.update_server_route(&server).await.unwrap();
    assert_eq!(instance.route_count(), 0);

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_unresolvable_server_is_an_error() {
    let fx = fixture();
    let listener = fx.listener().await;
    let mut server = fx
        .server(&listener, "lobby.example.com", ServerStatus::Stopped, 25565)
        .await;
    fx.manager.start().await.unwrap();

    server.status = ServerStatus::Running;
    server.container_id = Some("cairn-missing".to_string());
    let err = fx.manager.update_server_route(&server).await.unwrap_err();
    assert!(matches!(err, ProxyError::Resolve { .. }));

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_module_ports_opened_and_evicted() {
    let fx = fixture();
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let listener = fx.listener().await;
    let server = fx
        .server(&listener, "lobby.example.com", ServerStatus::Running, 25565)
        .await;
    fx.manager.start().await.unwrap();

    let module_port_number = free_port().await;
    let mut module = ModuleRecord::new(server.id, "rcon");
    module
        .ports
        .push(module_port(module_port_number, echo.addr.port(), "tcp"));

    fx.manager.add_module_route(&module, &server).await.unwrap();
    let instance = fx.manager.instance(module_port_number).await.unwrap();
    assert_eq!(instance.kind(), ProxyKind::Tcp);

    let mut client = TcpStream::connect((LOOPBACK, module_port_number))
        .await
        .unwrap();
    client.write_all(b"list").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"list");
    drop(client);

    let removed = fx.manager.remove_module_route(&module.id).await;
    assert_eq!(removed, 1);
    assert!(fx.manager.instance(module_port_number).await.is_none());
    assert_eq!(fx.manager.ports().await, vec![listener.port]);

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_conflicting_module_protocols() {
    let fx = fixture();
    let listener = fx.listener().await;
    let server = fx
        .server(&listener, "lobby.example.com", ServerStatus::Running, 25565)
        .await;
    let shared = free_port().await;

    let mut rcon = ModuleRecord::new(server.id, "rcon");
    rcon.ports.push(module_port(shared, 25575, "tcp"));
    let mut voice = ModuleRecord::new(server.id, "voice");
    voice.ports.push(module_port(shared, 24454, "udp"));

    fx.manager.add_module_route(&rcon, &server).await.unwrap();
    let err = fx.manager.add_module_route(&voice, &server).await.unwrap_err();
    assert!(matches!(
        err,
        ProxyError::KindMismatch {
            existing: ProxyKind::Tcp,
            requested: ProxyKind::Udp,
            ..
        }
    ));
    assert_eq!(
        fx.manager.instance(shared).await.unwrap().kind(),
        ProxyKind::Tcp
    );

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_module_port_changes_protocol() {
    let fx = fixture();
    let listener = fx.listener().await;
    let server = fx
        .server(&listener, "lobby.example.com", ServerStatus::Running, 25565)
        .await;
    let voice_port = free_port().await;

    let mut module = ModuleRecord::new(server.id, "voice");
    module.ports.push(module_port(voice_port, 24454, "tcp"));
    fx.manager.add_module_route(&module, &server).await.unwrap();
    assert_eq!(
        fx.manager.instance(voice_port).await.unwrap().kind(),
        ProxyKind::Tcp
    );

    module.ports[0].protocol = "udp".to_string();
    fx.manager.update_module_route(&module, &server).await.unwrap();

    let instance = fx.manager.instance(voice_port).await.unwrap();
    assert_eq!(instance.kind(), ProxyKind::Udp);
    assert!(instance.is_running().await);
    assert_eq!(instance.route_count(), 1);
    let routes = fx.manager.get_routes().await;
    assert_eq!(routes[&voice_port].kind, ProxyKind::Udp);

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_unknown_module_protocol() {
    let fx = fixture();
    let listener = fx.listener().await;
    let server = fx
        .server(&listener, "lobby.example.com", ServerStatus::Running, 25565)
        .await;

    let mut module = ModuleRecord::new(server.id, "odd");
    module.ports.push(module_port(free_port().await, 1, "sctp"));
    let err = fx.manager.add_module_route(&module, &server).await.unwrap_err();
    assert!(matches!(err, ProxyError::UnknownProtocol(p) if p == "sctp"));
}

#[tokio::test]
async fn test_http_module_uses_server_hostname() {
    let fx = fixture();
    let listener = fx.listener().await;
    let server = fx
        .server(&listener, "lobby.example.com", ServerStatus::Running, 25565)
        .await;
    let map_port = free_port().await;

    let mut module = ModuleRecord::new(server.id, "map");
    module.ports.push(module_port(map_port, 8100, "http"));
    fx.manager.add_module_route(&module, &server).await.unwrap();

    let routes = fx.manager.get_routes().await;
    let map = &routes[&map_port];
    assert_eq!(map.kind, ProxyKind::Http);
    assert!(map.listener_id.is_none());
    assert_eq!(map.routes["lobby.example.com"].backend_port, 8100);

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_refresh_routes_corrects_drift() {
    let fx = fixture();
    let listener = fx.listener().await;
    let server = fx
        .server(&listener, "lobby.example.com", ServerStatus::Running, 25565)
        .await;
    fx.manager.start().await.unwrap();

    let instance = fx.manager.instance(listener.port).await.unwrap();
    instance.clear_routes();
    instance.add_route("stale", "stale.example.com", LOOPBACK, 1);

    fx.manager.refresh_routes().await.unwrap();
    let routes = fx.manager.instance(listener.port).await.unwrap().get_routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes["lobby.example.com"].owner_id, server.id.to_string());

    // Disabling the listener in the store stops it on the next refresh.
    let mut disabled = listener.clone();
    disabled.enabled = false;
    fx.store.save_listener(disabled).await.unwrap();
    fx.manager.refresh_routes().await.unwrap();
    assert!(fx.manager.instance(listener.port).await.is_none());

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_allocate_skips_taken_ports() {
    let fx = fixture();
    let range = fx.manager.config().proxy_port_range.clone();

    let mut holder = ServerRecord::new("holder");
    holder.proxy_port = Some(*range.start());
    fx.store.save_server(holder).await.unwrap();

    let fresh = ServerRecord::new("fresh");
    let port = fx.manager.allocate_proxy_port(&fresh.id).await.unwrap();
    assert_eq!(port, range.start() + 1);
}

#[tokio::test]
async fn test_lifecycle_events_drive_routes() {
    use cairn_events::LifecycleEvent;
    use cairn_proxy::sync::apply_event;

    let fx = fixture();
    let listener = fx.listener().await;
    let server = fx
        .server(&listener, "lobby.example.com", ServerStatus::Stopped, 25565)
        .await;
    let map_port = free_port().await;
    let mut module = ModuleRecord::new(server.id, "map");
    module.ports.push(module_port(map_port, 8100, "http"));
    fx.store.save_module(module.clone()).await.unwrap();
    fx.manager.start().await.unwrap();
    assert!(fx.manager.instance(map_port).await.is_none());

    let started = LifecycleEvent::ServerStatusChanged {
        server_id: server.id,
        status: ServerStatus::Running,
    };
    apply_event(&fx.manager, fx.store.as_ref(), &started)
        .await
        .unwrap();
    let routes = fx.manager.get_routes().await;
    assert!(routes[&listener.port].routes.contains_key("lobby.example.com"));
    assert!(routes[&map_port].routes.contains_key("lobby.example.com"));

    let stopped = LifecycleEvent::ServerStatusChanged {
        server_id: server.id,
        status: ServerStatus::Stopped,
    };
    apply_event(&fx.manager, fx.store.as_ref(), &stopped)
        .await
        .unwrap();
    assert_eq!(
        fx.manager.instance(listener.port).await.unwrap().route_count(),
        0
    );
    assert!(fx.manager.instance(map_port).await.is_none());

    fx.manager.stop().await;
}
