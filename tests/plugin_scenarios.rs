//! End-to-end scenarios against the full plugin: negotiation, mountpoint
//! publication, registry traffic, media relay and teardown.

mod common;

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use common::{FakeGateway, RtspMessage, RtspTestClient, StubRegistry, wait_for_mount};
use rtsp_source::{rtcp, Codec, MessageResult, Plugin, PluginConfig};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(
    min_port: u16,
    max_port: u16,
    registry: Option<&StubRegistry>,
    priority: Vec<Codec>,
) -> PluginConfig {
    PluginConfig {
        udp_min_port: min_port,
        udp_max_port: max_port,
        rtsp_interface: "127.0.0.1".to_string(),
        rtsp_port: 0,
        status_service_url: registry.map(|r| format!("{}/streams", r.base_url)),
        codec_priority: priority,
        ..PluginConfig::default()
    }
}

fn vp8_offer() -> String {
    "v=0\r\n\
     o=- 1 1 IN IP4 192.168.1.10\r\n\
     s=-\r\n\
     t=0 0\r\n\
     m=video 9 UDP/TLS/RTP/SAVPF 100 96\r\n\
     c=IN IP4 192.168.1.10\r\n\
     a=rtpmap:100 VP8/90000\r\n\
     a=sendrecv\r\n"
        .to_string()
}

fn dual_codec_offer() -> String {
    "v=0\r\n\
     o=- 1 1 IN IP4 192.168.1.10\r\n\
     s=-\r\n\
     t=0 0\r\n\
     m=video 9 UDP/TLS/RTP/SAVPF 96 107\r\n\
     c=IN IP4 192.168.1.10\r\n\
     a=rtpmap:96 VP8/90000\r\n\
     a=rtpmap:107 H264/90000\r\n"
        .to_string()
}

fn attach_and_offer(plugin: &Plugin, gateway: &FakeGateway, id: &str, offer: &str) -> String {
    plugin.create_session(1).unwrap();
    let result = plugin.handle_message(
        1,
        Some("t1".to_string()),
        Some(json!({ "id": id })),
        Some(json!({ "type": "offer", "sdp": offer })),
    );
    assert!(matches!(result, MessageResult::OkWait(_)));

    let answer = gateway
        .wait_for_event(EVENT_TIMEOUT, |e| e.jsep.is_some())
        .expect("no answer event");
    assert_eq!(answer.event["result"], "ok");
    let jsep = answer.jsep.unwrap();
    assert_eq!(jsep["type"], "answer");
    jsep["sdp"].as_str().unwrap().to_string()
}

#[test]
fn s1_happy_path_video_only_vp8() {
    let gateway = Arc::new(FakeGateway::default());
    let registry = StubRegistry::start(r#"{"_id":"r1"}"#);
    let config = test_config(46000, 46099, Some(&registry), vec![Codec::Vp8]);
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    let answer_sdp = attach_and_offer(&plugin, &gateway, "cam1", &vp8_offer());
    // VP8 was already first; the video line keeps PT 100 up front.
    assert!(answer_sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 100"));

    // Ten loopback sockets, all pool ports.
    assert_eq!(plugin.allocated_udp_ports(), 10);

    // The mountpoint shows up and advertises the feedback capabilities.
    let mount_sdp =
        wait_for_mount(plugin.rtsp_port(), "cam1", EVENT_TIMEOUT).expect("mount not published");
    assert!(mount_sdp.contains("m=video 0 RTP/AVPF 96"));
    assert!(mount_sdp.contains("a=rtcp-fb:96 ccm fir"));
    assert!(mount_sdp.contains("a=rtcp-fb:96 nack"));
    assert!(mount_sdp.contains("a=rtcp-fb:96 nack pli"));
    assert!(mount_sdp.contains("VP8/90000"));

    // The registry saw the create with the stream id.
    assert!(registry.wait_for_request(EVENT_TIMEOUT, "POST", "/streams"));
    let create = registry
        .recorded()
        .into_iter()
        .find(|(m, _, _)| m == "POST")
        .unwrap();
    assert!(create.2.contains("cam1"));

    // Teardown returns every port and deletes the registry record.
    plugin.destroy_session(1).unwrap();
    assert_eq!(plugin.allocated_udp_ports(), 0);
    assert!(registry.wait_for_request(EVENT_TIMEOUT, "DELETE", "/streams/r1"));
    let uri = format!("rtsp://127.0.0.1:{}/cam1", plugin.rtsp_port());
    let mut client = RtspTestClient::connect(plugin.rtsp_port()).unwrap();
    let (status, _, _) = client.request("DESCRIBE", &uri, 1, &[]).unwrap();
    assert_eq!(status, 404);

    plugin.destroy();
}

#[test]
fn s2_duplicate_id_hangs_up_with_error_414() {
    let gateway = Arc::new(FakeGateway::default());
    let registry = StubRegistry::start(r#"{"code":11000}"#);
    let config = test_config(46100, 46199, Some(&registry), vec![Codec::Vp8]);
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    plugin.create_session(1).unwrap();
    plugin.handle_message(
        1,
        Some("t1".to_string()),
        Some(json!({ "id": "cam1" })),
        Some(json!({ "type": "offer", "sdp": vp8_offer() })),
    );

    let error = gateway
        .wait_for_event(EVENT_TIMEOUT, |e| e.event.get("error_code").is_some())
        .expect("no error event");
    assert_eq!(error.event["error_code"], 414);
    assert!(error.event["error"]
        .as_str()
        .unwrap()
        .contains("already exist"));

    // The hangup pushed its `done` notification.
    gateway
        .wait_for_event(EVENT_TIMEOUT, |e| e.event["result"] == "done")
        .expect("no done event");

    // No mountpoint was published.
    assert!(wait_for_mount(plugin.rtsp_port(), "cam1", Duration::from_millis(500)).is_none());

    // The session is still alive and destroyable.
    plugin.destroy_session(1).unwrap();
    assert_eq!(plugin.allocated_udp_ports(), 0);
    plugin.destroy();
}

#[test]
fn s3_codec_priority_selects_h264_over_vp8() {
    let gateway = Arc::new(FakeGateway::default());
    let config = test_config(46200, 46299, None, vec![Codec::H264, Codec::Vp8]);
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    let answer_sdp = attach_and_offer(&plugin, &gateway, "cam3", &dual_codec_offer());
    assert!(answer_sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 107 96"));

    // The mount repackages the chosen codec at PT 96.
    let mount_sdp =
        wait_for_mount(plugin.rtsp_port(), "cam3", EVENT_TIMEOUT).expect("mount not published");
    assert!(mount_sdp.contains("a=rtpmap:96 H264/90000"));

    plugin.destroy_session(1).unwrap();
    plugin.destroy();
}

#[test]
fn s4_bitrate_cap_sends_a_remb() {
    let gateway = Arc::new(FakeGateway::default());
    let config = test_config(46300, 46349, None, Vec::new());
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    plugin.create_session(1).unwrap();
    plugin.handle_message(
        1,
        Some("t1".to_string()),
        Some(json!({ "bitrate": 128000 })),
        None,
    );

    let ok = gateway
        .wait_for_event(EVENT_TIMEOUT, |e| e.event["result"] == "ok")
        .expect("no ok event");
    assert!(ok.jsep.is_none());

    assert_eq!(plugin.query_session(1).unwrap()["bitrate"], 128000);
    let packets = gateway.rtcp_packets();
    let (video, remb) = packets.first().expect("no RTCP relayed");
    assert!(*video);
    assert_eq!(remb.as_slice(), rtcp::remb(128_000).as_ref());

    plugin.destroy();
}

#[test]
fn s5_slow_link_halves_the_bitrate() {
    let gateway = Arc::new(FakeGateway::default());
    let config = test_config(46350, 46399, None, Vec::new());
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    plugin.create_session(1).unwrap();
    plugin.slow_link(1, false, true);

    let info = plugin.query_session(1).unwrap();
    assert_eq!(info["bitrate"], 256_000);
    assert_eq!(info["slowlink_count"], 1);

    let packets = gateway.rtcp_packets();
    let (video, remb) = packets.first().expect("no REMB relayed");
    assert!(*video);
    assert_eq!(remb.as_slice(), rtcp::remb(256_000).as_ref());

    gateway
        .wait_for_event(EVENT_TIMEOUT, |e| {
            e.event["result"]["status"] == "slow_link" && e.event["result"]["bitrate"] == 256_000
        })
        .expect("no slow_link event");

    // A second report halves again.
    plugin.slow_link(1, false, true);
    assert_eq!(plugin.query_session(1).unwrap()["bitrate"], 128_000);

    plugin.destroy();
}

#[test]
fn s6_clean_teardown_sends_teardown_to_subscribed_client() {
    let gateway = Arc::new(FakeGateway::default());
    let registry = StubRegistry::start(r#"{"_id":"r6"}"#);
    let config = test_config(46400, 46499, Some(&registry), vec![Codec::Vp8]);
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    attach_and_offer(&plugin, &gateway, "cam6", &vp8_offer());
    let port = plugin.rtsp_port();
    wait_for_mount(port, "cam6", EVENT_TIMEOUT).expect("mount not published");

    let uri = format!("rtsp://127.0.0.1:{port}/cam6");
    let mut client = RtspTestClient::connect(port).unwrap();
    let (status, headers, _) = client
        .request(
            "SETUP",
            &format!("{uri}/stream=0"),
            2,
            &[(
                "Transport",
                "RTP/AVP;unicast;client_port=47000-47001".to_string(),
            )],
        )
        .unwrap();
    assert_eq!(status, 200);
    let session_id = headers.get("session").expect("no session id").clone();
    assert!(headers["transport"].contains("server_port="));

    let (status, _, _) = client
        .request("PLAY", &uri, 3, &[("Session", session_id)])
        .unwrap();
    assert_eq!(status, 200);

    // Destroying the session tears the mount down: the client receives a
    // TEARDOWN directed at the mount URI, then the connection closes.
    plugin.destroy_session(1).unwrap();
    match client.read_message().expect("no TEARDOWN received") {
        RtspMessage::Request { method, uri: teardown_uri } => {
            assert_eq!(method, "TEARDOWN");
            assert!(teardown_uri.contains("/cam6"));
        }
        other => panic!("expected a TEARDOWN request, got {other:?}"),
    }
    assert!(client.read_message().is_err(), "connection should be closed");

    assert_eq!(plugin.allocated_udp_ports(), 0);
    assert!(registry.wait_for_request(EVENT_TIMEOUT, "DELETE", "/streams/r6"));
    plugin.destroy();
}

#[test]
fn media_relays_rtp_to_playing_clients_and_rtcp_back() {
    let gateway = Arc::new(FakeGateway::default());
    let config = test_config(46500, 46599, None, vec![Codec::Vp8]);
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    attach_and_offer(&plugin, &gateway, "cam7", &vp8_offer());
    let port = plugin.rtsp_port();
    wait_for_mount(port, "cam7", EVENT_TIMEOUT).expect("mount not published");

    // Receive the stream on a real local socket.
    let rtp_sink = UdpSocket::bind("127.0.0.1:0").unwrap();
    rtp_sink
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let rtp_port = rtp_sink.local_addr().unwrap().port();

    let uri = format!("rtsp://127.0.0.1:{port}/cam7");
    let mut client = RtspTestClient::connect(port).unwrap();
    let (status, headers, _) = client
        .request(
            "SETUP",
            &format!("{uri}/stream=0"),
            2,
            &[(
                "Transport",
                format!("RTP/AVP;unicast;client_port={}-{}", rtp_port, rtp_port + 1),
            )],
        )
        .unwrap();
    assert_eq!(status, 200);
    let session_id = headers["session"].clone();
    let (status, _, _) = client
        .request("PLAY", &uri, 3, &[("Session", session_id)])
        .unwrap();
    assert_eq!(status, 200);

    // Feed RTP with the negotiated PT 100 through the host surface and
    // expect it on the client socket, repackaged to PT 96.
    let mut rtp = vec![0x80u8, 100, 0, 1, 0, 0, 0, 1, 0, 0, 0, 42];
    rtp.extend_from_slice(&[0xde; 8]);

    let mut received = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 1500];
    while Instant::now() < deadline {
        plugin.incoming_rtp(1, true, &rtp);
        if let Ok(len) = rtp_sink.recv(&mut buf) {
            received = Some(buf[..len].to_vec());
            break;
        }
    }
    let received = received.expect("no RTP reached the client");
    assert_eq!(received[1] & 0x7f, 96, "payload type must be repackaged");
    assert_eq!(received.len(), rtp.len());
    assert_eq!(&received[2..], &rtp[2..]);

    // RTCP sent by the client toward the advertised server port comes
    // back through the gateway relay.
    let server_rtcp_port: u16 = {
        let transport = &headers["transport"];
        let server_ports = transport
            .split(';')
            .find_map(|p| p.trim().strip_prefix("server_port="))
            .expect("no server_port");
        server_ports.split('-').nth(1).unwrap().parse().unwrap()
    };
    let rtcp_sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let receiver_report = [0x80u8, 201, 0, 1, 0, 0, 0, 7];
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut relayed = false;
    while Instant::now() < deadline {
        rtcp_sender
            .send_to(&receiver_report, ("127.0.0.1", server_rtcp_port))
            .unwrap();
        if gateway
            .rtcp_packets()
            .iter()
            .any(|(video, buf)| *video && buf.as_slice() == receiver_report)
        {
            relayed = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(relayed, "client RTCP never reached the gateway relay");

    plugin.destroy_session(1).unwrap();
    plugin.destroy();
}

#[test]
fn message_with_only_an_id_succeeds_without_media() {
    let gateway = Arc::new(FakeGateway::default());
    let config = test_config(46600, 46620, None, Vec::new());
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    plugin.create_session(1).unwrap();
    plugin.handle_message(1, Some("t1".to_string()), Some(json!({ "id": "idle" })), None);
    let ok = gateway
        .wait_for_event(EVENT_TIMEOUT, |e| e.event["result"] == "ok")
        .expect("no ok event");
    assert!(ok.jsep.is_none());
    assert_eq!(plugin.allocated_udp_ports(), 0);

    plugin.destroy();
}

#[test]
fn offer_without_media_lines_is_ok_but_publishes_nothing() {
    let gateway = Arc::new(FakeGateway::default());
    let config = test_config(46621, 46640, None, Vec::new());
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    plugin.create_session(1).unwrap();
    let offer = "v=0\r\no=- 1 1 IN IP4 192.168.1.10\r\ns=-\r\nt=0 0\r\n";
    plugin.handle_message(
        1,
        Some("t1".to_string()),
        Some(json!({ "id": "empty" })),
        Some(json!({ "type": "offer", "sdp": offer })),
    );

    let answer = gateway
        .wait_for_event(EVENT_TIMEOUT, |e| e.jsep.is_some())
        .expect("no answer event");
    assert_eq!(answer.event["result"], "ok");
    assert_eq!(plugin.allocated_udp_ports(), 0);
    assert!(wait_for_mount(plugin.rtsp_port(), "empty", Duration::from_millis(300)).is_none());

    plugin.destroy();
}

#[test]
fn type_mismatches_report_invalid_element() {
    let gateway = Arc::new(FakeGateway::default());
    let config = test_config(46641, 46660, None, Vec::new());
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    plugin.create_session(1).unwrap();
    plugin.handle_message(
        1,
        Some("t1".to_string()),
        Some(json!({ "audio": "yes" })),
        None,
    );
    let error = gateway
        .wait_for_event(EVENT_TIMEOUT, |e| e.event.get("error_code").is_some())
        .expect("no error event");
    assert_eq!(error.event["error_code"], 413);

    // A missing message is its own error.
    plugin.handle_message(1, Some("t2".to_string()), None, None);
    let error = gateway
        .wait_for_event(EVENT_TIMEOUT, |e| {
            e.transaction.as_deref() == Some("t2") && e.event.get("error_code").is_some()
        })
        .expect("no error event");
    assert_eq!(error.event["error_code"], 411);

    // A message with no supported attribute at all.
    plugin.handle_message(1, Some("t3".to_string()), Some(json!({ "bogus": 1 })), None);
    let error = gateway
        .wait_for_event(EVENT_TIMEOUT, |e| {
            e.transaction.as_deref() == Some("t3") && e.event.get("error_code").is_some()
        })
        .expect("no error event");
    assert_eq!(error.event["error_code"], 413);

    plugin.destroy();
}

#[test]
fn hangup_twice_pushes_done_once() {
    let gateway = Arc::new(FakeGateway::default());
    let config = test_config(46661, 46680, None, Vec::new());
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    plugin.create_session(1).unwrap();
    plugin.query_session(1).unwrap();
    plugin.handle_message(1, None, Some(json!({ "bitrate": 90000, "video": false })), None);
    gateway
        .wait_for_event(EVENT_TIMEOUT, |e| e.event["result"] == "ok")
        .expect("no ok event");

    plugin.hangup_media(1);
    plugin.hangup_media(1);

    let done_events = gateway
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.event["result"] == "done")
        .count();
    assert_eq!(done_events, 1);

    // Hangup reset the controls.
    let info = plugin.query_session(1).unwrap();
    assert_eq!(info["bitrate"], 0);
    assert_eq!(info["video_active"], true);

    plugin.destroy();
}

#[test]
fn destroy_session_is_idempotent() {
    let gateway = Arc::new(FakeGateway::default());
    let config = test_config(46681, 46699, None, Vec::new());
    let mut plugin = Plugin::init_with_config(gateway.clone(), config).unwrap();

    plugin.create_session(1).unwrap();
    plugin.destroy_session(1).unwrap();
    // Lazily-freed sessions make a repeat destroy a no-op.
    plugin.destroy_session(1).unwrap();
    // A handle that never existed is still an error.
    assert!(plugin.destroy_session(99).is_err());

    plugin.destroy();
}

#[test]
fn config_file_loading_follows_the_flat_category() {
    let dir = std::env::temp_dir().join(format!("rtsp-source-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("plugin.rtsp-source.cfg"),
        "[general]\n\
         udp_port_range = 5000-4000\n\
         keepalive_interval = 7\n\
         status_service_url = http://reg/streams/\n\
         video_codec_priority = H264,VP8\n\
         interface = 10.0.0.5\n\
         rtsp_port = 9000\n",
    )
    .unwrap();

    let config = PluginConfig::load(&dir, "plugin.rtsp-source").unwrap();
    assert_eq!((config.udp_min_port, config.udp_max_port), (4000, 5000));
    assert_eq!(config.keepalive_interval, Duration::from_secs(7));
    assert_eq!(config.status_service_url.as_deref(), Some("http://reg/streams"));
    assert_eq!(config.codec_priority, vec![Codec::H264, Codec::Vp8]);
    assert_eq!(config.rtsp_interface, "10.0.0.5");
    assert_eq!(config.rtsp_port, 9000);

    // A missing file falls back to the defaults.
    let missing = PluginConfig::load(&dir, "no-such-package").unwrap();
    assert_eq!((missing.udp_min_port, missing.udp_max_port), (4000, 5000));

    std::fs::remove_dir_all(&dir).ok();
}
