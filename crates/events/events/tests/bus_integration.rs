//! Integration tests for the DXP event bus
//!
//! This test suite covers:
//! - Start-once façade initialization under concurrent first use
//! - Backend selection and fallback
//! - Cross-instance delivery over a shared store
//! - The reconnection circuit breaker

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dxp_events::{
    BusBackend, BusConfig, BusFactory, Event, EventBus, EventFacade, EventType, HistoryQuery,
    SharedStoreBus,
    store::{ConnectionEvent, ConnectionRole, MemorySharedStore},
};

mod facade_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_creates_one_bus() {
        let facade = Arc::new(EventFacade::new(BusConfig::default()));

        let mut handles = Vec::new();
        for i in 0..32 {
            let facade = facade.clone();
            handles.push(tokio::spawn(async move {
                let bus = facade.bus().await.unwrap();
                facade
                    .emit_event(Event::new(EventType::DownloadStarted, format!("dl-{}", i)))
                    .await;
                bus
            }));
        }

        let mut buses = Vec::new();
        for handle in handles {
            buses.push(handle.await.unwrap());
        }
        assert!(buses.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(facade.stats().await.unwrap().published, 32);
    }

    #[tokio::test]
    async fn test_history_pattern_query() {
        let facade = EventFacade::new(BusConfig::default());
        facade.emit_event(Event::new(EventType::DeploymentStarted, "dep-1")).await;
        facade.emit_event(Event::new(EventType::ExportStarted, "exp-1")).await;
        facade.emit_event(Event::new(EventType::DeploymentSucceeded, "dep-1")).await;

        let deployments = facade
            .history(HistoryQuery::new().pattern("deployment.*"))
            .await
            .unwrap();
        assert_eq!(deployments.len(), 2);
        assert_eq!(deployments[1].event_type, EventType::DeploymentSucceeded);
    }
}

mod factory_tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_selector_is_rejected() {
        assert!("kafka".parse::<BusBackend>().is_err());
        assert_eq!("In-Memory".parse::<BusBackend>().unwrap(), BusBackend::Memory);
    }

    #[tokio::test]
    async fn test_shared_backend_over_store() {
        let store = Arc::new(MemorySharedStore::new());
        let config = BusConfig::default()
            .backend(BusBackend::Redis)
            .project_id("My-Client #1");
        let facade = EventFacade::with_factory(BusFactory::with_store(config, store.clone()));

        let received = Arc::new(AtomicUsize::new(0));
        let r = received.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        facade
            .on("export.*", move |_event| {
                let r = r.clone();
                let tx = tx.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(());
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert!(facade.emit_event(Event::new(EventType::ExportSucceeded, "exp-1")).await);
        rx.recv().await.unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(facade.health().await.backend, BusBackend::Redis);
    }
}

mod reconnection_tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_breaker_through_store_notifications() {
        let store = Arc::new(MemorySharedStore::new());
        let config = BusConfig::default().backend(BusBackend::Redis).project_id("acme");
        let bus = SharedStoreBus::new(store.clone(), &config);
        bus.initialize().await.unwrap();
        // Let the initial ready notifications drain first.
        for _ in 0..100 {
            if bus.health().await.healthy {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(bus.health().await.healthy);

        for _ in 0..10 {
            bus.handle_connection_event(
                ConnectionRole::Publisher,
                ConnectionEvent::Disconnected("connection reset".into()),
            )
            .await;
            bus.handle_connection_event(ConnectionRole::Publisher, ConnectionEvent::Reconnecting)
                .await;
        }
        let state = bus.reconnection_state().await;
        assert!(state.circuit_open);
        assert!(!bus.health().await.healthy);

        bus.handle_connection_event(ConnectionRole::Publisher, ConnectionEvent::Ready).await;
        bus.handle_connection_event(ConnectionRole::Subscriber, ConnectionEvent::Ready).await;
        let state = bus.reconnection_state().await;
        assert!(!state.circuit_open);
        assert_eq!(state.attempts, 0);
        assert!(bus.health().await.healthy);
    }
}
