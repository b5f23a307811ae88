//! Whole-engine round trips through the public launcher surface.

use std::net::TcpListener;
use std::time::Duration;

use fixgate::messages::{
    GatewayEvent, InitiateRequest, LibraryCommand, LogonStatus, SequenceNumberType,
    AUTOMATIC_INITIAL_SEQUENCE_NUMBER,
};
use fixgate::{EngineConfiguration, FixEngine};

const LIBRARY_ID: i32 = 3;

fn launch() -> FixEngine {
    let configuration = EngineConfiguration::default().bind_to("127.0.0.1", 0);
    FixEngine::launch(configuration).expect("engine launches")
}

#[test]
fn library_connect_round_trips_a_heartbeat() {
    let mut engine = launch();
    let commands = engine.command_sender();
    let events = engine.take_events().expect("first consumer");

    commands
        .send(LibraryCommand::LibraryConnect {
            library_id: LIBRARY_ID,
            correlation_id: 1,
            aeron_session_id: 234,
        })
        .unwrap();

    let event = events
        .recv_timeout(Duration::from_secs(5))
        .expect("engine replied");
    assert!(matches!(
        event,
        GatewayEvent::ApplicationHeartbeat {
            library_id: LIBRARY_ID
        }
    ));
    engine.close();
}

#[test]
fn initiate_connects_and_publishes_manage_connection_then_logon() {
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let target = server.local_addr().unwrap();

    let mut engine = launch();
    let commands = engine.command_sender();
    let events = engine.take_events().unwrap();

    commands
        .send(LibraryCommand::LibraryConnect {
            library_id: LIBRARY_ID,
            correlation_id: 1,
            aeron_session_id: 234,
        })
        .unwrap();
    commands
        .send(LibraryCommand::InitiateConnection(Box::new(InitiateRequest {
            library_id: LIBRARY_ID,
            host: target.ip().to_string(),
            port: target.port(),
            sender_comp_id: "LEH_LZJ02".to_string(),
            sender_sub_id: None,
            sender_location_id: None,
            target_comp_id: "CCG".to_string(),
            sequence_number_type: SequenceNumberType::Transient,
            initial_sequence_number: AUTOMATIC_INITIAL_SEQUENCE_NUMBER,
            username: None,
            password: None,
            heartbeat_interval_s: 10,
            correlation_id: 2,
        })))
        .unwrap();

    // The engine really dialled us.
    let (_stream, _) = server.accept().expect("engine connected");

    // ApplicationHeartbeat, then ManageConnection, then Logon(NEW).
    let mut kinds = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while kinds.len() < 3 && std::time::Instant::now() < deadline {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
            kinds.push(event);
        }
    }
    assert!(matches!(
        kinds.first(),
        Some(GatewayEvent::ApplicationHeartbeat { .. })
    ));
    assert!(matches!(
        kinds.get(1),
        Some(GatewayEvent::ManageConnection {
            library_id: LIBRARY_ID,
            reply_to_id: 2,
            ..
        })
    ));
    assert!(matches!(
        kinds.get(2),
        Some(GatewayEvent::Logon {
            library_id: LIBRARY_ID,
            status: LogonStatus::New,
            ..
        })
    ));
    engine.close();
}
