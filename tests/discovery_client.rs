use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;

use svcdir_client::{
    AnnounceRequest, Candidate, ClientConfig, ClientStatus, Clock, DirectoryClient,
    DiscoveryClient, DiscoveryEvent, HostResolver, HttpRequest, HttpResponse, IteratorState,
    Method, RequestOptions, ResultCode, ServiceIterator, SvcDirError, Transport, TransportError,
    TransportErrorKind,
};
use url::Url;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct DirectoryState {
    /// service -> (version, ip, port, check), in announce order.
    members: HashMap<String, Vec<(String, String, u16, String)>>,
    down: HashSet<String>,
    /// Addresses that answer 404 to every member list.
    stale: HashSet<String>,
    dead_checks: HashSet<String>,
    versions: HashMap<String, (Option<String>, Option<String>)>,
    forced_announce: Option<(u16, String)>,
    requests: Vec<HttpRequest>,
}

/// In-memory directory answering on any address not marked down.
#[derive(Default)]
struct FakeDirectory {
    state: Mutex<DirectoryState>,
}

impl FakeDirectory {
    fn new() -> Arc<Self> {
        Arc::new(FakeDirectory::default())
    }

    fn take_down(&self, address: &str) {
        self.state.lock().unwrap().down.insert(address.to_string());
    }

    fn bring_up(&self, address: &str) {
        self.state.lock().unwrap().down.remove(address);
    }

    fn make_stale(&self, address: &str) {
        self.state.lock().unwrap().stale.insert(address.to_string());
    }

    fn kill_healthcheck_host(&self, host: &str) {
        self.state.lock().unwrap().dead_checks.insert(host.to_string());
    }

    fn seed(&self, service: &str, members: &[(&str, u16)]) {
        let mut state = self.state.lock().unwrap();
        let list = state.members.entry(service.to_string()).or_default();
        for (ip, port) in members {
            list.push(("1".into(), ip.to_string(), *port, String::new()));
        }
    }

    fn forget(&self, service: &str, ip: &str, port: u16) {
        let mut state = self.state.lock().unwrap();
        if let Some(list) = state.members.get_mut(service) {
            list.retain(|(_, i, p, _)| !(i == ip && *p == port));
        }
    }

    fn force_announce_response(&self, status: u16, body: &str) {
        self.state.lock().unwrap().forced_announce = Some((status, body.to_string()));
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    fn member_count(&self, service: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .members
            .get(service)
            .map_or(0, Vec::len)
    }

    fn handle(state: &mut DirectoryState, address: &str, request: &HttpRequest) -> HttpResponse {
        let url = Url::parse(&request.url).unwrap();
        let segments: Vec<String> = url.path_segments().unwrap().map(str::to_string).collect();
        let mut params: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if let Some(body) = &request.body {
            params.extend(
                url::form_urlencoded::parse(body.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned())),
            );
        }
        let param = |name: &str| params.get(name).cloned().unwrap_or_default();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        match (request.method, segments.as_slice()) {
            (Method::Post, ["v1", "announce"]) => {
                if let Some((status, body)) = &state.forced_announce {
                    return HttpResponse::new(*status, "Forced", body.clone());
                }
                let check = param("check");
                let check_host = Url::parse(&check)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_default();
                if state.dead_checks.contains(&check_host) {
                    return HttpResponse::new(
                        404,
                        "Not Found",
                        format!("healthcheck {} unreachable", check),
                    );
                }
                let port: u16 = param("port").parse().unwrap();
                let list = state.members.entry(param("service")).or_default();
                list.retain(|(v, ip, p, _)| {
                    !(*v == param("version") && *ip == param("ip") && *p == port)
                });
                list.push((param("version"), param("ip"), port, check));
                HttpResponse::new(200, "OK", format!("{}\n", address))
            }
            (Method::Post, ["v1", "deannounce"]) => {
                let port: u16 = param("port").parse().unwrap();
                let list = state.members.entry(param("service")).or_default();
                let before = list.len();
                list.retain(|(v, ip, p, _)| {
                    !(*v == param("version") && *ip == param("ip") && *p == port)
                });
                if list.len() == before {
                    HttpResponse::new(404, "Not Found", "no such instance")
                } else {
                    HttpResponse::new(200, "OK", "")
                }
            }
            (Method::Get, ["v1", "members", _]) if state.stale.contains(address) => {
                HttpResponse::new(404, "Not Found", "unknown service")
            }
            (Method::Get, ["v1", "members", service]) => match state.members.get(*service) {
                Some(list) => {
                    let body: String = list
                        .iter()
                        .map(|(_, ip, port, _)| format!("member {}:{} up\n", ip, port))
                        .collect();
                    HttpResponse::new(200, "OK", format!("# {}\n{}", service, body))
                }
                None => HttpResponse::new(404, "Not Found", "unknown service"),
            },
            (Method::Get, ["v1", "config", "version"]) => {
                let service = param("service");
                match state.versions.get(&service) {
                    Some((current, previous)) => HttpResponse::new(
                        200,
                        "OK",
                        format!(
                            r#"<service name="{}" currentVersion="{}" previousVersion="{}"/>"#,
                            service,
                            current.clone().unwrap_or_default(),
                            previous.clone().unwrap_or_default()
                        ),
                    ),
                    None => HttpResponse::new(404, "Not Found", "unknown service"),
                }
            }
            (Method::Post, ["v1", "config", "version"]) => {
                let service = param("service");
                let entry = state.versions.entry(service.clone()).or_default();
                entry.1 = entry.0.take();
                entry.0 = Some(param("version"));
                HttpResponse::new(
                    200,
                    "OK",
                    format!(
                        r#"<service name="{}" currentVersion="{}" previousVersion="{}"/>"#,
                        service,
                        param("version"),
                        entry.1.clone().unwrap_or_default()
                    ),
                )
            }
            (Method::Delete, ["v1", "config", "version"]) => {
                match state.versions.remove(&param("service")) {
                    Some(_) => HttpResponse::new(200, "OK", ""),
                    None => HttpResponse::new(404, "Not Found", ""),
                }
            }
            _ => HttpResponse::new(400, "Bad Request", "unknown endpoint"),
        }
    }
}

impl Transport for FakeDirectory {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        let url = Url::parse(&request.url).unwrap();
        let address = format!("{}:{}", url.host_str().unwrap(), url.port().unwrap());
        if state.down.contains(&address) {
            return Err(TransportError::new(
                TransportErrorKind::Timeout,
                request.url.clone(),
                "timed out",
            ));
        }
        Ok(FakeDirectory::handle(&mut state, &address, request))
    }
}

/// Resolver with a fixed table that counts lookups.
struct CountingResolver {
    table: HashMap<String, IpAddr>,
    lookups: AtomicUsize,
}

impl CountingResolver {
    fn new() -> Arc<Self> {
        let table = [
            ("web01", "10.0.0.1"),
            ("web02", "10.0.0.2"),
            ("localbox", "10.0.0.99"),
        ]
        .into_iter()
        .map(|(h, ip)| (h.to_string(), ip.parse().unwrap()))
        .collect();
        Arc::new(CountingResolver {
            table,
            lookups: AtomicUsize::new(0),
        })
    }

    fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl HostResolver for CountingResolver {
    fn resolve(&self, host: &str) -> Result<IpAddr, String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.table
            .get(host)
            .copied()
            .ok_or_else(|| "NXDOMAIN".to_string())
    }

    fn local_hostname(&self) -> Option<String> {
        Some("localbox".into())
    }
}

struct FixedClock;

impl Clock for FixedClock {
    fn now_secs(&self) -> u64 {
        1_700_000_000
    }
}

fn test_config() -> ClientConfig {
    ClientConfig {
        local_config_path: PathBuf::from("/nonexistent/svcdir/client.json"),
        well_known_address: "dir1:4080".into(),
        role_file: PathBuf::from("/nonexistent/svcdir/role"),
        domain_file: PathBuf::from("/nonexistent/svcdir/domain"),
        ..Default::default()
    }
}

struct Harness {
    directory: Arc<FakeDirectory>,
    resolver: Arc<CountingResolver>,
    client: DirectoryClient,
}

fn harness_with(config: ClientConfig) -> Harness {
    init_logger();
    let directory = FakeDirectory::new();
    let resolver = CountingResolver::new();
    let client = DirectoryClient::builder(config)
        .transport(directory.clone())
        .resolver(resolver.clone())
        .clock(Arc::new(FixedClock))
        .build()
        .unwrap();
    Harness {
        directory,
        resolver,
        client,
    }
}

fn harness() -> Harness {
    harness_with(test_config())
}

fn web01(port: u16) -> AnnounceRequest {
    AnnounceRequest::new("search", "1.0.0", "web01", port, "http://web01:8080/status")
}

fn drain(iterator: &mut impl ServiceIterator<Item = Candidate>) -> Vec<Candidate> {
    let mut out = Vec::new();
    while let Some(candidate) = iterator.next_item().unwrap() {
        out.push(candidate);
    }
    out
}

#[test]
fn announce_then_resolve_round_trip() {
    let h = harness();
    let record = h.client.announce(&web01(8080)).unwrap();
    assert_eq!(record.key.host, "10.0.0.1");
    assert_eq!(record.served_by, "dir1:4080");
    assert_eq!(record.announced_at, 1_700_000_000);
    assert_eq!(record.healthcheck, "http://10.0.0.1:8080/status");

    let mut iterator = h.client.open("search").unwrap();
    assert_eq!(drain(&mut iterator), vec![Candidate::new("10.0.0.1", 8080)]);
}

#[test]
fn reannounce_replaces_record() {
    let h = harness();
    h.client.announce(&web01(8080)).unwrap();
    h.client
        .announce(&web01(8080).with_metadata("zone", "b"))
        .unwrap();

    let records = h.client.announcements();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].metadata.get("zone").map(String::as_str), Some("b"));
    assert_eq!(h.directory.member_count("search"), 1);
}

#[test]
fn deannounce_is_symmetric() {
    let h = harness();
    h.client.announce(&web01(8080)).unwrap();
    assert_eq!(
        h.client.cached_ip("search", "web01", "1.0.0", 8080).as_deref(),
        Some("10.0.0.1")
    );

    h.client.deannounce("search", "1.0.0", "web01", 8080).unwrap();
    assert!(h.client.announcements().is_empty());
    assert_eq!(h.client.cached_ip("search", "web01", "1.0.0", 8080), None);

    let last = h.directory.requests().pop().unwrap();
    assert_eq!(
        last.body.as_deref(),
        Some("service=search&version=1.0.0&ip=10.0.0.1&port=8080")
    );

    let again = h.client.deannounce("search", "1.0.0", "web01", 8080);
    assert_eq!(ResultCode::of(&again), ResultCode::NotFound);
}

#[test]
fn iterator_exhausts_after_n_and_reset_refills() {
    let h = harness();
    h.directory
        .seed("search", &[("10.0.0.3", 80), ("10.0.0.1", 80), ("10.0.0.2", 81)]);

    let mut iterator = h.client.open("search").unwrap();
    assert_eq!(iterator.state(), IteratorState::Empty);

    let mut pulled = 0;
    while let Some(_) = iterator.next_item().unwrap() {
        pulled += 1;
        assert_eq!(iterator.cursor(), pulled);
    }
    assert_eq!(pulled, 3);
    assert_eq!(iterator.state(), IteratorState::Exhausted);
    assert_eq!(iterator.next_item().unwrap(), None);

    iterator.reset();
    assert_eq!(iterator.state(), IteratorState::Empty);
    assert_eq!(iterator.cursor(), 0);
    let again = drain(&mut iterator);
    assert_eq!(
        again,
        vec![
            Candidate::new("10.0.0.3", 80),
            Candidate::new("10.0.0.1", 80),
            Candidate::new("10.0.0.2", 81),
        ]
    );
    assert_eq!(h.directory.request_count(), 2);
}

#[test]
fn iterator_implements_std_iterator() {
    let h = harness();
    h.directory.seed("search", &[("10.0.0.1", 80), ("10.0.0.2", 80)]);

    let candidates = h
        .client
        .open("search")
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(candidates.len(), 2);
}

#[test]
fn empty_member_list_is_exhausted_immediately() {
    let h = harness();
    h.directory.seed("search", &[]);

    let mut iterator = h.client.open("search").unwrap();
    assert_eq!(iterator.next_item().unwrap(), None);
    assert_eq!(iterator.state(), IteratorState::Exhausted);
}

#[test]
fn close_is_safe_in_any_state() {
    let h = harness();
    h.directory.seed("search", &[("10.0.0.1", 80), ("10.0.0.2", 80)]);

    let mut fresh = h.client.open("search").unwrap();
    fresh.close();
    fresh.close();
    assert_eq!(fresh.next_item().unwrap(), None);
    assert_eq!(fresh.state(), IteratorState::Closed);

    let mut midway = h.client.open("search").unwrap();
    midway.next_item().unwrap();
    midway.close();
    assert!(midway.candidates().is_empty());
    assert_eq!(midway.cursor(), 0);
    midway.reset();
    assert_eq!(midway.next_item().unwrap(), None);
    assert_eq!(h.directory.request_count(), 1);
}

#[test]
fn unknown_service_is_not_found() {
    let h = harness();
    let mut iterator = h.client.open("nope").unwrap();
    let err = iterator.next_item().unwrap_err();
    assert_eq!(err.code(), ResultCode::NotFound);
    assert_eq!(h.client.status(), ClientStatus::Available);
}

#[test]
fn stale_directory_does_not_hide_members() {
    let h = harness_with(ClientConfig {
        directory_override: Some("dir0:4080".into()),
        ..test_config()
    });
    h.directory.make_stale("dir0:4080");
    h.directory.seed("search", &[("10.0.0.5", 80)]);

    let mut iterator = h.client.open("search").unwrap();
    assert_eq!(drain(&mut iterator), vec![Candidate::new("10.0.0.5", 80)]);
    assert_eq!(h.directory.request_count(), 2);
}

#[test]
fn service_unknown_everywhere_is_not_found() {
    let h = harness_with(ClientConfig {
        directory_override: Some("dir0:4080".into()),
        ..test_config()
    });
    h.directory.make_stale("dir0:4080");

    let outcome = h.client.open("nope").unwrap().next_item();
    assert_eq!(ResultCode::of(&outcome), ResultCode::NotFound);
    assert_eq!(h.directory.request_count(), 2);
    assert_eq!(h.client.status(), ClientStatus::Available);
}

#[test]
fn open_rejects_empty_service() {
    let h = harness();
    assert!(matches!(
        h.client.open(""),
        Err(SvcDirError::InvalidArgs(_))
    ));
}

#[test]
fn invalid_announce_makes_no_network_call() {
    let h = harness();
    let outcome = h.client.announce(&AnnounceRequest::new(
        "",
        "1.0.0",
        "web01",
        80,
        "http://x/health",
    ));
    assert_eq!(ResultCode::of(&outcome), ResultCode::InvalidArgs);

    let outcome = h.client.announce(&AnnounceRequest::new(
        "search",
        "1.0.0",
        "web01",
        80,
        "x/health",
    ));
    assert_eq!(ResultCode::of(&outcome), ResultCode::InvalidArgs);

    assert_eq!(h.directory.request_count(), 0);
    assert_eq!(h.resolver.lookups(), 0);
    assert_eq!(h.client.status(), ClientStatus::Unknown);
}

#[test]
fn dead_healthcheck_is_not_found() {
    let h = harness();
    h.directory.kill_healthcheck_host("10.0.0.2");

    let outcome = h.client.announce(&AnnounceRequest::new(
        "search",
        "1.0.0",
        "web02",
        80,
        "http://web02/health",
    ));
    assert_eq!(ResultCode::of(&outcome), ResultCode::NotFound);
    assert!(h.client.announcements().is_empty());
    assert_eq!(h.client.cached_ip("search", "web02", "1.0.0", 80), None);
}

#[test]
fn failover_makes_exactly_two_attempts() {
    let h = harness_with(ClientConfig {
        directory_override: Some("dir0:4080".into()),
        ..test_config()
    });
    h.directory.seed("search", &[("10.0.0.1", 80), ("10.0.0.2", 80)]);
    h.directory.take_down("dir0:4080");

    let mut iterator = h.client.open("search").unwrap();
    assert_eq!(drain(&mut iterator).len(), 2);

    let urls: Vec<String> = h.directory.requests().into_iter().map(|r| r.url).collect();
    assert_eq!(
        urls,
        vec![
            "http://dir0:4080/v1/members/search".to_string(),
            "http://dir1:4080/v1/members/search".to_string(),
        ]
    );
}

#[test]
fn per_call_directory_override_is_tried_first() {
    let h = harness();
    h.directory.seed("search", &[("10.0.0.1", 80)]);

    let options = RequestOptions::default().with_directory("dir9:5000");
    let mut iterator = h.client.open_with("search", options).unwrap();
    drain(&mut iterator);

    let requests = h.directory.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, "http://dir9:5000/v1/members/search");
}

#[test]
fn dns_is_resolved_once_per_key() {
    let h = harness();
    h.client.announce(&web01(8080)).unwrap();
    h.client.announce(&web01(8080)).unwrap();
    assert_eq!(h.resolver.lookups(), 1);

    h.client.announce(&web01(8081)).unwrap();
    assert_eq!(h.resolver.lookups(), 2);
}

#[test]
fn dns_failure_stops_announce() {
    let h = harness();
    let outcome = h.client.announce(&AnnounceRequest::new(
        "search",
        "1.0.0",
        "ghost",
        80,
        "http://ghost/health",
    ));
    assert!(matches!(outcome, Err(SvcDirError::DnsResolve { ref host, .. }) if host == "ghost"));
    assert_eq!(h.directory.request_count(), 0);
}

#[test]
fn self_host_uses_healthcheck_host() {
    let h = harness();
    let record = h
        .client
        .announce(&AnnounceRequest::new(
            "search",
            "1.0.0",
            "0.0.0.0",
            8080,
            "http://web01:8080/status",
        ))
        .unwrap();
    assert_eq!(record.key.host, "10.0.0.1");
    assert_eq!(record.hostname, "web01");
    assert_eq!(record.requested_host, "0.0.0.0");

    let announce = &h.directory.requests()[0];
    assert!(announce
        .body
        .as_deref()
        .unwrap()
        .contains("check=http%3A%2F%2F10.0.0.1%3A8080%2Fstatus"));

    h.client.deannounce("search", "1.0.0", "0.0.0.0", 8080).unwrap();
    assert!(h.client.announcements().is_empty());
    assert_eq!(h.directory.member_count("search"), 0);
}

#[test]
fn empty_host_deannounce_uses_local_address() {
    let h = harness();
    h.directory.seed("search", &[]);
    let outcome = h.client.deannounce("search", "1.0.0", "", 80);
    assert_eq!(ResultCode::of(&outcome), ResultCode::NotFound);
    let last = h.directory.requests().pop().unwrap();
    assert!(last.body.unwrap().contains("ip=10.0.0.99"));
}

#[test]
fn server_errors_carry_the_message() {
    let h = harness();
    h.directory
        .force_announce_response(500, r#"<status message="store unavailable"/>"#);
    match h.client.announce(&web01(80)) {
        Err(SvcDirError::ServerError(message)) => assert!(message.contains("store unavailable")),
        other => panic!("unexpected outcome {:?}", other),
    }

    h.directory.force_announce_response(200, "thanks!");
    let outcome = h.client.announce(&web01(80));
    assert_eq!(ResultCode::of(&outcome), ResultCode::ServerError);
    assert!(h.client.announcements().is_empty());
}

#[test]
fn first_failure_disables_until_reset() {
    let h = harness();
    let mut events = h.client.subscribe();
    h.directory.take_down("dir1:4080");

    let first = h.client.open("search").unwrap().next_item();
    assert_eq!(ResultCode::of(&first), ResultCode::NoDirectoryAvailable);
    assert_eq!(h.client.status(), ClientStatus::Disabled);
    assert!(matches!(events.try_recv(), Ok(DiscoveryEvent::DirectoryDisabled)));

    let calls = h.directory.request_count();
    let second = h.client.open("search").unwrap().next_item();
    assert_eq!(ResultCode::of(&second), ResultCode::Disabled);
    let deannounce = h.client.deannounce("search", "1.0.0", "web01", 80);
    assert_eq!(ResultCode::of(&deannounce), ResultCode::Disabled);
    assert_eq!(h.directory.request_count(), calls);

    h.directory.bring_up("dir1:4080");
    h.client.reset_disabled();
    assert!(matches!(events.try_recv(), Ok(DiscoveryEvent::DirectoryReenabled)));
    assert_eq!(h.client.status(), ClientStatus::Unknown);
    h.client.announce(&web01(80)).unwrap();
    assert_eq!(h.client.status(), ClientStatus::Available);
}

#[test]
fn later_outages_are_not_disabling() {
    let h = harness();
    h.directory.seed("search", &[("10.0.0.1", 80)]);
    drain(&mut h.client.open("search").unwrap());

    h.directory.take_down("dir1:4080");
    let outcome = h.client.open("search").unwrap().next_item();
    assert_eq!(ResultCode::of(&outcome), ResultCode::NoDirectoryAvailable);
    let again = h.client.open("search").unwrap().next_item();
    assert_eq!(ResultCode::of(&again), ResultCode::NoDirectoryAvailable);
    assert_eq!(h.client.status(), ClientStatus::Available);
}

#[test]
fn no_located_directory_is_unavailable() {
    let h = harness_with(ClientConfig {
        well_known_address: String::new(),
        ..test_config()
    });
    let outcome = h.client.announce(&web01(80));
    assert_eq!(ResultCode::of(&outcome), ResultCode::NoDirectoryAvailable);
    assert_eq!(h.directory.request_count(), 0);
    assert_eq!(h.client.cached_ip("search", "web01", "1.0.0", 80), None);
}

#[test]
fn deannounce_all_continues_past_failures() {
    let h = harness();
    h.client.announce(&web01(80)).unwrap();
    h.client.announce(&web01(81)).unwrap();
    h.directory.forget("search", "10.0.0.1", 80);

    let outcomes = h.client.deannounce_all();
    let codes: BTreeMap<u16, ResultCode> = outcomes
        .iter()
        .map(|(key, outcome)| (key.port, ResultCode::of(outcome)))
        .collect();
    assert_eq!(codes.get(&80), Some(&ResultCode::NotFound));
    assert_eq!(codes.get(&81), Some(&ResultCode::Success));

    let remaining = h.client.announcements();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].key.port, 80);
}

#[test]
fn announce_and_deannounce_publish_events() {
    let h = harness();
    let mut events = h.client.subscribe();
    h.client.announce(&web01(80)).unwrap();
    h.client.deannounce("search", "1.0.0", "web01", 80).unwrap();

    match events.try_recv() {
        Ok(DiscoveryEvent::Announced(record)) => assert_eq!(record.key.port, 80),
        other => panic!("unexpected event {:?}", other),
    }
    match events.try_recv() {
        Ok(DiscoveryEvent::Deannounced(key)) => assert_eq!(key.host, "10.0.0.1"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn routing_overrides_are_merged_into_header() {
    init_logger();
    let directory = FakeDirectory::new();
    directory.seed("search", &[("10.0.0.1", 80)]);
    let client = DirectoryClient::builder(ClientConfig {
        routing_override: Some("local,shared".into()),
        ..test_config()
    })
    .transport(directory.clone())
    .resolver(CountingResolver::new())
    .route_override("caller")
    .build()
    .unwrap();

    let options = RequestOptions::default().with_route("request,shared");
    drain(&mut client.open_with("search", options).unwrap());

    let request = &directory.requests()[0];
    assert_eq!(
        request.header("X-Directory-Route"),
        Some("request,shared,caller,local")
    );
}

#[test]
fn default_version_configuration() {
    let h = harness();
    assert_eq!(
        ResultCode::of(&h.client.get_default_version("search")),
        ResultCode::NotFound
    );

    let set = h.client.set_default_version("search", "2.0").unwrap();
    assert_eq!(set.current_version.as_deref(), Some("2.0"));
    assert_eq!(set.previous_version, None);

    let set = h.client.set_default_version("search", "2.1").unwrap();
    assert_eq!(set.previous_version.as_deref(), Some("2.0"));

    let read = h.client.get_default_version("search").unwrap();
    assert_eq!(read.name, "search");
    assert_eq!(read.current_version.as_deref(), Some("2.1"));

    h.client.delete_default_version("search").unwrap();
    assert_eq!(
        ResultCode::of(&h.client.delete_default_version("search")),
        ResultCode::NotFound
    );
    assert_eq!(
        ResultCode::of(&h.client.set_default_version("search", "")),
        ResultCode::InvalidArgs
    );
}

#[test]
fn announce_from_config_section() {
    let h = harness_with(ClientConfig {
        announce: Some(
            AnnounceRequest::new("search", "3.0", "0.0.0.0", 9000, "http://web02:9000/ok")
                .with_metadata("zone", "a"),
        ),
        ..test_config()
    });
    let record = h.client.announce_from_config().unwrap();
    assert_eq!(record.key.host, "10.0.0.2");
    assert_eq!(record.key.port, 9000);

    let bare = harness();
    assert_eq!(
        ResultCode::of(&bare.client.announce_from_config()),
        ResultCode::InvalidArgs
    );
}

#[test]
fn concurrent_announces_keep_one_record_per_key() {
    let h = harness();
    let client = Arc::new(h.client);

    let handles: Vec<_> = (0..8u16)
        .map(|i| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for _ in 0..5 {
                    client.announce(&web01(9000 + i % 4)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(client.announcements().len(), 4);
    assert_eq!(h.directory.member_count("search"), 4);
    assert!(h.resolver.lookups() >= 4);
    for port in 9000..9004 {
        assert_eq!(
            client.cached_ip("search", "web01", "1.0.0", port).as_deref(),
            Some("10.0.0.1")
        );
    }
}

#[test]
fn drop_deannounces_when_configured() {
    let directory = FakeDirectory::new();
    {
        let client = DirectoryClient::builder(ClientConfig {
            deannounce_on_drop: true,
            ..test_config()
        })
        .transport(directory.clone())
        .resolver(CountingResolver::new())
        .build()
        .unwrap();
        client.announce(&web01(80)).unwrap();
        assert_eq!(directory.member_count("search"), 1);
    }
    assert_eq!(directory.member_count("search"), 0);
}

/// Holds announce requests carrying an `attempt` parameter until both are in flight. The
/// failing one answers at once; the other waits until the test opens the gate.
struct GatedDirectory {
    inner: Arc<FakeDirectory>,
    both_in_flight: Barrier,
    open: Mutex<bool>,
    opened: Condvar,
}

impl GatedDirectory {
    fn open_gate(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

impl Transport for GatedDirectory {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let body = request.body.clone().unwrap_or_default();
        if !body.contains("attempt=") {
            return self.inner.execute(request);
        }
        self.both_in_flight.wait();
        if body.contains("attempt=fail") {
            return Ok(HttpResponse::new(500, "Internal Server Error", "store down"));
        }
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        drop(open);
        self.inner.execute(request)
    }
}

#[test]
fn failed_announce_keeps_ip_of_concurrent_success() {
    init_logger();
    let directory = FakeDirectory::new();
    let gated = Arc::new(GatedDirectory {
        inner: directory.clone(),
        both_in_flight: Barrier::new(2),
        open: Mutex::new(false),
        opened: Condvar::new(),
    });
    let client = Arc::new(
        DirectoryClient::builder(test_config())
            .transport(gated.clone())
            .resolver(CountingResolver::new())
            .build()
            .unwrap(),
    );

    let failing = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.announce(&web01(8080).with_metadata("attempt", "fail")))
    };
    let succeeding = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.announce(&web01(8080).with_metadata("attempt", "ok")))
    };

    let failed = failing.join().unwrap();
    assert_eq!(ResultCode::of(&failed), ResultCode::ServerError);
    gated.open_gate();
    succeeding.join().unwrap().unwrap();

    assert_eq!(client.announcements().len(), 1);
    assert_eq!(
        client.cached_ip("search", "web01", "1.0.0", 8080).as_deref(),
        Some("10.0.0.1")
    );

    client.deannounce("search", "1.0.0", "web01", 8080).unwrap();
    assert!(client.announcements().is_empty());
    assert_eq!(directory.member_count("search"), 0);
    let last = directory.requests().pop().unwrap();
    assert!(last.body.unwrap().contains("ip=10.0.0.1"));
}
