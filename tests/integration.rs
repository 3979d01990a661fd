//! Integration tests: spawn the mockka binary against a temp rule tree and
//! drive it over HTTP; wiremock plays the proxy upstream.

use std::io::Read as _;
use std::path::PathBuf;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mockka_bin() -> String {
    std::env::var("CARGO_BIN_EXE_mockka").unwrap_or_else(|_| {
        format!(
            "{}/target/debug/mockka",
            std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into())
        )
    })
}

/// Grab a free port by binding to 0 and letting the listener go.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct TestServer {
    child: std::process::Child,
    dir: PathBuf,
    port: u16,
}

impl TestServer {
    /// Write a config into a fresh scratch dir and spawn `mockka run`.
    /// `extra_config` is appended verbatim to the YAML (e.g. a processing
    /// section).
    async fn start(name: &str, extra_config: &str) -> TestServer {
        let dir = std::env::temp_dir().join("mockka_integration").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("rules")).unwrap();
        std::fs::create_dir_all(dir.join("logs")).unwrap();

        let port = free_port();
        let config = format!(
            "data:\n\
             \x20 rule-dir: {rules}\n\
             \x20 log-dir: {logs}\n\
             \x20 check-delay: 1\n\
             http:\n\
             \x20 ip: \"127.0.0.1\"\n\
             \x20 port: {port}\n\
             \x20 read-timeout: 5\n\
             \x20 write-timeout: 5\n\
             logging:\n\
             \x20 level: debug\n\
             {extra_config}",
            rules = dir.join("rules").display(),
            logs = dir.join("logs").display(),
        );
        let config_path = dir.join("mockka.yaml");
        std::fs::write(&config_path, config).unwrap();

        let stderr = std::fs::File::create(dir.join("stderr.log")).unwrap();
        let child = std::process::Command::new(mockka_bin())
            .args(["run", "--config", config_path.to_str().unwrap()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::from(stderr))
            .spawn()
            .expect("spawn mockka");

        let server = TestServer { child, dir, port };
        server.wait_ready().await;
        server
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path_and_query)
    }

    fn rules_dir(&self) -> PathBuf {
        self.dir.join("rules")
    }

    fn log_file(&self, service: &str) -> PathBuf {
        self.dir.join("logs").join(format!("{service}.log"))
    }

    fn write_rule(&self, rel: &str, content: &str) {
        let path = self.rules_dir().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    async fn wait_ready(&self) {
        let client = reqwest::Client::new();
        for _ in 0..100 {
            if client
                .get(self.url("/__mockka_ready__"))
                .send()
                .await
                .is_ok()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let mut stderr = String::new();
        if let Ok(mut f) = std::fs::File::open(self.dir.join("stderr.log")) {
            let _ = f.read_to_string(&mut stderr);
        }
        panic!("mockka did not become ready on port {}: {stderr}", self.port);
    }

    /// Poll until the given URL answers with the wanted status (rule reloads
    /// take up to check-delay seconds to become visible).
    async fn wait_for_status(&self, path_and_query: &str, wanted: u16) -> reqwest::Response {
        let client = reqwest::Client::new();
        let mut last = None;
        for _ in 0..50 {
            if let Ok(resp) = client.get(self.url(path_and_query)).send().await {
                if resp.status().as_u16() == wanted {
                    return resp;
                }
                last = Some(resp.status().as_u16());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        panic!(
            "{} never answered {} (last status: {:?})",
            path_and_query, wanted, last
        );
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[tokio::test]
async fn exact_match_serves_body_and_writes_log() {
    let server = TestServer::start("exact", "").await;
    server.write_rule(
        "svc/a.mock",
        "@REQUEST\nGET /x?b=2&a=1\n@CODE\n200\n@RESPONSE\nhi\n",
    );

    // Query order differs from the rule; normalization makes them equal.
    let resp = server.wait_for_status("/x?a=1&b=2", 200).await;
    let server_header = resp
        .headers()
        .get("server")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert!(server_header.starts_with("mockka/"), "got {server_header:?}");
    assert_eq!(resp.text().await.unwrap(), "hi\n");

    // One transaction record in the per-service log.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let log = std::fs::read_to_string(server.log_file("svc")).unwrap();
    assert!(log.contains("Request:                 GET /x?a=1&b=2"));
    assert!(log.contains("Status Code:             200 OK"));
    assert!(log.contains("+ RESPONSE BODY"));
    assert!(log.contains("hi\n"));
}

#[tokio::test]
async fn missing_rule_answers_599_with_error_header() {
    let server = TestServer::start("missing", "").await;

    let resp = reqwest::get(server.url("/nowhere")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 599);
    assert_eq!(
        resp.headers().get("x-mockka-error").unwrap(),
        "RuleNotFound"
    );
    assert_eq!(resp.text().await.unwrap(), "");
}

#[tokio::test]
async fn wildcard_fallback_and_exact_precedence() {
    let server = TestServer::start("wildcard", "").await;
    server.write_rule("svc/w.mock", "@REQUEST\nGET /users/*\n@RESPONSE\nwild\n");
    server.write_rule("svc/e.mock", "@REQUEST\nGET /users/42\n@RESPONSE\nexact\n");

    let resp = server.wait_for_status("/users/42", 200).await;
    assert_eq!(resp.text().await.unwrap(), "exact\n");

    let resp = server.wait_for_status("/users/7", 200).await;
    assert_eq!(resp.text().await.unwrap(), "wild\n");
}

#[tokio::test]
async fn multi_response_varies_and_inherits_default_code() {
    let server = TestServer::start("multi", "").await;
    server.write_rule(
        "svc/m.mock",
        "@REQUEST\nGET /multi\n\
         @CODE\n201\n\
         @RESPONSE:1\n{\"n\":1}\n\
         @RESPONSE:2\n{\"n\":2}\n",
    );

    server.wait_for_status("/multi", 201).await;

    let client = reqwest::Client::new();
    let mut seen_one = 0;
    let mut seen_two = 0;
    for _ in 0..60 {
        let resp = client.get(server.url("/multi")).send().await.unwrap();
        // Responses 1 and 2 carry no code; _default's 201 applies to both.
        assert_eq!(resp.status().as_u16(), 201);
        match resp.text().await.unwrap().as_str() {
            "{\"n\":1}\n" => seen_one += 1,
            "{\"n\":2}\n" => seen_two += 1,
            other => panic!("unexpected body {other:?}"),
        }
    }
    assert!(seen_one >= 5, "response 1 picked only {seen_one} times");
    assert!(seen_two >= 5, "response 2 picked only {seen_two} times");
}

#[tokio::test]
async fn proxy_with_and_without_overwrite() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(
            ResponseTemplate::new(418)
                .insert_header("X-Z", "9")
                .set_body_string("teapot"),
        )
        .mount(&upstream)
        .await;

    let server = TestServer::start("proxy", "processing:\n  allow-proxying: true\n").await;
    server.write_rule(
        "svc/over.mock",
        &format!("@REQUEST\nGET /over\n@RESPONSE<<{}/x\n", upstream.uri()),
    );
    server.write_rule(
        "svc/plain.mock",
        &format!(
            "@REQUEST\nGET /plain\n@RESPONSE<{}/x\n@CODE\n200\n@HEADERS\nX-Rule:yes\n",
            upstream.uri()
        ),
    );

    // Overwrite: upstream status and headers win.
    let resp = server.wait_for_status("/over", 418).await;
    assert_eq!(resp.headers().get("x-z").unwrap(), "9");
    assert_eq!(resp.text().await.unwrap(), "teapot");

    // No overwrite: the rule's status and headers, the upstream's body.
    let resp = server.wait_for_status("/plain", 200).await;
    assert_eq!(resp.headers().get("x-rule").unwrap(), "yes");
    assert!(resp.headers().get("x-z").is_none());
    assert_eq!(resp.text().await.unwrap(), "teapot");
}

#[tokio::test]
async fn proxying_disabled_answers_forbidden() {
    let server = TestServer::start("noproxy", "").await;
    server.write_rule(
        "svc/p.mock",
        "@REQUEST\nGET /p\n@RESPONSE<<http://127.0.0.1:1/unreachable\n",
    );

    let resp = server.wait_for_status("/p", 599).await;
    assert_eq!(
        resp.headers().get("x-mockka-error").unwrap(),
        "ForbidenAction"
    );
}

#[tokio::test]
async fn basic_auth_is_enforced() {
    let server = TestServer::start("auth", "").await;
    server.write_rule(
        "svc/a.mock",
        "@REQUEST\nGET /secure\n@AUTH\nuser1:secret\n@RESPONSE\nwelcome\n",
    );

    let resp = server.wait_for_status("/secure", 401).await;
    assert_eq!(resp.content_length().unwrap_or(0), 0);

    let client = reqwest::Client::new();
    let resp = client
        .get(server.url("/secure"))
        .basic_auth("user1", Some("secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "welcome\n");

    let resp = client
        .get(server.url("/secure"))
        .basic_auth("user1", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
}

#[tokio::test]
async fn auto_head_falls_back_to_get_rules() {
    let server = TestServer::start("autohead", "processing:\n  auto-head: true\n").await;
    server.write_rule("svc/g.mock", "@REQUEST\nGET /doc\n@RESPONSE\ncontent\n");

    server.wait_for_status("/doc", 200).await;

    let client = reqwest::Client::new();
    let resp = client.head(server.url("/doc")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "");
}

#[tokio::test]
async fn templated_body_uses_request_accessors() {
    let server = TestServer::start("template", "").await;
    server.write_rule(
        "svc/t.mock",
        "@REQUEST\nGET /hello?name=*\n@RESPONSE\nhello {{ Query(name=\"name\") }}\n",
    );

    let resp = server.wait_for_status("/hello?name=world", 200).await;
    assert_eq!(resp.text().await.unwrap(), "hello world\n");
}

#[tokio::test]
async fn hot_reload_adds_and_removes_rules() {
    let server = TestServer::start("reload", "").await;

    let resp = reqwest::get(server.url("/late")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 599);

    // New file is picked up within the check-delay window.
    server.write_rule("svc/late.mock", "@REQUEST\nGET /late\n@RESPONSE\nfinally\n");
    let resp = server.wait_for_status("/late", 200).await;
    assert_eq!(resp.text().await.unwrap(), "finally\n");

    // Deleting the file unloads the rule.
    std::fs::remove_file(server.rules_dir().join("svc/late.mock")).unwrap();
    let resp = server.wait_for_status("/late", 599).await;
    assert_eq!(
        resp.headers().get("x-mockka-error").unwrap(),
        "RuleNotFound"
    );
}

#[tokio::test]
async fn validate_command_reports_config_state() {
    let dir = std::env::temp_dir().join("mockka_integration").join("validate");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(dir.join("rules")).unwrap();

    let good = dir.join("good.yaml");
    std::fs::write(
        &good,
        format!(
            "data:\n  rule-dir: {}\n  log-dir: {}\n",
            dir.join("rules").display(),
            dir.display()
        ),
    )
    .unwrap();
    let status = std::process::Command::new(mockka_bin())
        .args(["validate", "--config", good.to_str().unwrap()])
        .status()
        .unwrap();
    assert!(status.success());

    let bad = dir.join("bad.yaml");
    std::fs::write(
        &bad,
        format!(
            "data:\n  rule-dir: {}\n  log-dir: {}\n  check-delay: 0\n",
            dir.join("rules").display(),
            dir.display()
        ),
    )
    .unwrap();
    let status = std::process::Command::new(mockka_bin())
        .args(["validate", "--config", bad.to_str().unwrap()])
        .status()
        .unwrap();
    assert!(!status.success());
}
