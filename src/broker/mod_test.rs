use super::*;
use uuid::Uuid;

fn project(protocol: &str, port: i32) -> ProjectRow {
    ProjectRow {
        id: Uuid::new_v4(),
        name: "Greenhouse".into(),
        slug: "greenhouse".into(),
        broker_client_id: "gh-01".into(),
        broker_address: "broker.local".into(),
        broker_port: port,
        broker_protocol: protocol.into(),
    }
}

#[test]
fn endpoint_uri_uses_project_fields() {
    let endpoint = BrokerEndpoint::from_project(&project("tcp", 1883)).unwrap();
    assert_eq!(endpoint.uri(), "tcp://broker.local:1883");
    assert_eq!(endpoint.client_id, "gh-01");
}

#[test]
fn endpoint_defaults_blank_protocol_to_tcp() {
    let endpoint = BrokerEndpoint::from_project(&project("  ", 1883)).unwrap();
    assert_eq!(endpoint.scheme, DEFAULT_BROKER_PROTOCOL);
}

#[test]
fn endpoint_lowercases_protocol() {
    let endpoint = BrokerEndpoint::from_project(&project("MQTT", 1883)).unwrap();
    assert_eq!(endpoint.uri(), "mqtt://broker.local:1883");
}

#[test]
fn endpoint_rejects_out_of_range_port() {
    let err = BrokerEndpoint::from_project(&project("tcp", 70_000)).unwrap_err();
    assert!(matches!(err, BrokerError::InvalidPort(70_000)));
    assert!(matches!(
        BrokerEndpoint::from_project(&project("tcp", -1)),
        Err(BrokerError::InvalidPort(-1))
    ));
}
