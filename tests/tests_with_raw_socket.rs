use pinger::{PingConfig, PingError, PingInfo, PingListener, Pinger, SocketType};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use more_asserts as ma;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/*
* Note: Raw sockets work only with root privileges.
*/

#[derive(Default)]
struct Tally {
    started: usize,
    replies: Vec<(u16, Duration)>,
    timeouts: usize,
    failures: Vec<PingError>,
    stopped: usize,
}

#[derive(Clone, Default)]
struct TallyListener {
    tally: Arc<Mutex<Tally>>,
}

impl PingListener for TallyListener {
    fn on_start(&self, _info: &PingInfo) {
        self.tally.lock().unwrap().started += 1;
    }

    fn on_stop(&self, _info: &PingInfo) {
        self.tally.lock().unwrap().stopped += 1;
    }

    fn on_reply_received(&self, _info: &PingInfo, sequence: u16, elapsed: Duration) {
        self.tally.lock().unwrap().replies.push((sequence, elapsed));
    }

    fn on_timeout(&self, _info: &PingInfo, _sequence: u16) {
        self.tally.lock().unwrap().timeouts += 1;
    }

    fn on_exception(&self, _info: &PingInfo, error: &PingError, _is_fatal: bool) {
        self.tally.lock().unwrap().failures.push(error.clone());
    }
}

#[test]
#[ignore = "needs root"]
fn ping_localhost_with_raw_socket_succeeds() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::TRACE).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let listener = TallyListener::default();
    let pinger = Pinger::with_socket_type(listener.clone(), SocketType::Raw).unwrap();
    let config = PingConfig {
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(500),
        max_sequence: 4,
        pattern: b"pinger".to_vec(),
        reverse_lookup: false,
        ..PingConfig::default()
    };

    pinger.start("127.0.0.1", config).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while listener.tally.lock().unwrap().stopped == 0 {
        assert!(Instant::now() < deadline, "session did not stop in time");
        std::thread::sleep(Duration::from_millis(10));
    }

    let tally = listener.tally.lock().unwrap();
    assert_eq!(1, tally.started);
    assert_eq!(0, tally.timeouts);
    assert!(tally.failures.is_empty(), "{:?}", tally.failures);
    assert_eq!(vec![1, 2, 3, 4], tally.replies.iter().map(|(sequence, _)| *sequence).collect::<Vec<_>>());
    for (_, elapsed) in &tally.replies {
        ma::assert_lt!(*elapsed, Duration::from_millis(500));
    }
}
