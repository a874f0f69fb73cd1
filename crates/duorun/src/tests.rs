//! Host-level scenarios driven through `deliver`, without a peer endpoint.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use serde_json::json;

use duorpc::BootstrapRequest;
use duorpc::Command;
use duorpc::Envelope;
use duorpc::ExecResult;
use duorpc::Headers;
use duorpc::Packet;
use duorpc::markers;

use crate::Context;
use crate::Definition;
use crate::Host;
use crate::HostConfig;
use crate::Phase;
use crate::dispatch;
use crate::install;
use crate::runtime::Error;

/// Records lifecycle events so tests can assert on hook order and counts.
#[derive(Default)]
struct Journal(Mutex<Vec<String>>);

impl Journal {
    fn note(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

fn note(ctx: &Context, entry: &str) {
    if let Some(journal) = ctx.extension::<Arc<Journal>>() {
        journal.note(format!("{}:{}", entry, ctx.component()));
    }
}

fn explode() -> anyhow::Result<Value> {
    panic!("kaboom")
}

fn counter() -> Definition {
    Definition::library("Counter", || 0i64)
        .expose("increment", |n: &mut i64, _ctx, args| {
            async move {
                *n += args.first().and_then(Value::as_i64).unwrap_or(1);
                Ok(json!(*n))
            }
            .boxed()
        })
        .expose("read", |n: &mut i64, _ctx, _args| async move { Ok(json!(*n)) }.boxed())
        .expose("fail", |_: &mut i64, _ctx, _args| {
            async move { Err(anyhow::anyhow!("database password is hunter2")) }.boxed()
        })
        .expose("boom", |_: &mut i64, _ctx, _args| async move { explode() }.boxed())
        .method("reset", |n: &mut i64, _ctx, _args| {
            async move {
                *n = 0;
                Ok(Value::Null)
            }
            .boxed()
        })
        .expose("greet", |_: &mut i64, ctx, args| {
            async move {
                ctx.peer().call("render", args)?;
                Ok(Value::Null)
            }
            .boxed()
        })
        .expose("ask", |_: &mut i64, ctx, _args| {
            async move {
                let pending = ctx.peer().request("confirm", vec![])?;
                ctx.flush();
                let answer = pending.wait().await?;
                ctx.peer().call("render", vec![answer])?;
                Ok(Value::Null)
            }
            .boxed()
        })
        .expose("open_chart", |_: &mut i64, ctx, _args| {
            async move {
                ctx.install(["Chart"]);
                Ok(Value::Null)
            }
            .boxed()
        })
        .expose("open_vault", |_: &mut i64, ctx, _args| {
            async move {
                ctx.install(["Vault"]);
                Ok(Value::Null)
            }
            .boxed()
        })
        .expose("slow", |_: &mut i64, _ctx, _args| {
            async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(Value::Null)
            }
            .boxed()
        })
        .method("announce", |_: &mut i64, ctx, args| {
            async move {
                ctx.peer().call("render", args)?;
                ctx.flush();
                Ok(Value::Null)
            }
            .boxed()
        })
        .client_methods(["render", "confirm"])
        .on_construct(|_: &mut i64, input| {
            if let Some(journal) = input.extensions.get::<Arc<Journal>>() {
                journal.note("construct:Counter");
            }
            Ok(())
        })
        .on_new_client(|_: &mut i64, ctx| {
            async move {
                note(ctx, "new_client");
                Ok(())
            }
            .boxed()
        })
        .on_bootstrap_ready(|_: &mut i64, ctx| {
            async move {
                note(ctx, "bootstrap_ready");
                Ok(())
            }
            .boxed()
        })
        .build()
}

fn chart() -> Definition {
    Definition::feature("Chart", Vec::<Value>::new)
        .expose("plot", |points: &mut Vec<Value>, _ctx, args| {
            async move {
                points.extend(args);
                Ok(json!(points.len()))
            }
            .boxed()
        })
        .client_methods(["draw"])
        .resource("chart.css")
        .build()
}

/// Never available to any session.
fn vault() -> Definition {
    Definition::feature("Vault", || ())
        .gate(|_| false)
        .build()
}

fn host_with(config: HostConfig) -> (Host, Arc<Journal>) {
    let journal = Arc::new(Journal::default());
    let host = Host::builder(config)
        .extension(journal.clone())
        .register(counter())
        .register(chart())
        .register(vault())
        .build()
        .expect("host should build");
    (host, journal)
}

fn host() -> (Host, Arc<Journal>) {
    host_with(HostConfig::new("v2"))
}

async fn open(host: &Host, session: &str) -> Headers {
    let payload = host.bootstrap(session, BootstrapRequest::default()).await.unwrap();
    let identity = payload.ctor_arguments[0]["identity"].as_str().unwrap();
    Headers::new(identity, host.version())
}

async fn send(host: &Host, session: &str, headers: &Headers, commands: Vec<Command>) -> Packet {
    let envelope = Envelope::wrap(headers.clone(), &Packet::new(commands, None)).unwrap();
    duorpc::decode_packet(&host.deliver(session, envelope).await).unwrap()
}

fn call(comp: &str, cmd: &str, args: Vec<Value>) -> Command {
    Command::new(comp, cmd, args)
}

// ============================================================================
//  BATCHES
// ============================================================================

#[tokio::test]
async fn test_partial_failure_keeps_the_batch_going() {
    let (host, _) = host();
    let headers = open(&host, "s1").await;

    let response = send(&host, "s1", &headers, vec![
        call("Counter", "increment", vec![json!(1)]),
        call("Counter", "fail", vec![]),
        call("Counter", "increment", vec![json!(2)]),
    ]).await;

    assert_eq!(response.results(), &[
        Some(ExecResult::ok(json!(1))),
        Some(ExecResult::err(markers::INTERNAL)),
        Some(ExecResult::ok(json!(3))),
    ]);

    let value = host.inspect("s1", "Counter", |n: &i64| *n).await.unwrap();
    assert_eq!(value, 3);
}

#[tokio::test]
async fn test_panicking_method_is_contained() {
    let (host, _) = host();
    let headers = open(&host, "s1").await;

    let response = send(&host, "s1", &headers, vec![
        call("Counter", "boom", vec![]),
        call("Counter", "increment", vec![]),
    ]).await;

    assert_eq!(response.results()[0], Some(ExecResult::err(markers::INTERNAL)));
    assert_eq!(response.results()[1], Some(ExecResult::ok(json!(1))));
}

#[tokio::test]
async fn test_unknown_targets_are_skipped() {
    let (host, _) = host();
    let headers = open(&host, "s1").await;

    let response = send(&host, "s1", &headers, vec![
        call("Nope", "x", vec![]),
        call("Counter", "nope", vec![]),
        call("Counter", "reset", vec![]),
        call("Chart", "plot", vec![]),
        call("Counter", "read", vec![]),
    ]).await;

    let errors: Vec<_> = response.results().iter()
        .map(|r| r.as_ref().and_then(|r| r.error().map(str::to_string)))
        .collect();
    assert_eq!(errors, vec![
        Some(markers::UNKNOWN_COMPONENT.to_string()),
        Some(markers::UNKNOWN_COMMAND.to_string()),
        // private methods are invisible to the peer
        Some(markers::UNKNOWN_COMMAND.to_string()),
        // not installed in this session
        Some(markers::UNKNOWN_COMPONENT.to_string()),
        None,
    ]);
}

#[tokio::test]
async fn test_peer_calls_ride_on_the_response() {
    let (host, _) = host();
    let headers = open(&host, "s1").await;

    let response = send(&host, "s1", &headers, vec![
        call("Counter", "greet", vec![json!("a")]),
        call("Counter", "greet", vec![json!("b")]),
    ]).await;

    assert_eq!(response.commands, vec![
        call("Counter", "render", vec![json!("a")]),
        call("Counter", "render", vec![json!("b")]),
    ]);

    let next = send(&host, "s1", &headers, vec![]).await;
    assert!(next.commands.is_empty());
}

// ============================================================================
//  ENVELOPE
// ============================================================================

#[tokio::test]
async fn test_version_mismatch_requests_refresh_only() {
    let (host, _) = host();
    let headers = open(&host, "s1").await;
    let stale = Headers::new(headers.identity.clone().unwrap(), "v1");

    let response = send(&host, "s1", &stale, vec![call("Counter", "increment", vec![])]).await;

    assert_eq!(response.commands, vec![Command::new(duorpc::COMMUNICATIONS, duorpc::REQUEST_REFRESH, vec![])]);
    assert!(response.command_execution_results.is_none());
    assert_eq!(host.inspect("s1", "Counter", |n: &i64| *n).await.unwrap(), 0);
}

#[tokio::test]
async fn test_identity_and_malformed_requests() {
    let (host, _) = host();
    open(&host, "s1").await;

    let forged = Headers::new("not-the-token", "v2");
    let response = send(&host, "s1", &forged, vec![call("Counter", "increment", vec![])]).await;
    assert_eq!(response, Packet::failure(markers::IDENTITY));

    let garbage = Envelope::new(forged, b"{\"commands\": 5}".to_vec());
    let response = duorpc::decode_packet(&host.deliver("s1", garbage).await).unwrap();
    assert_eq!(response, Packet::failure(markers::PROTOCOL));

    assert_eq!(host.inspect("s1", "Counter", |n: &i64| *n).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_session_without_installed_list_refreshes() {
    let (host, _) = host();
    let response = send(&host, "ghost", &Headers::new("tok", "v2"), vec![]).await;
    assert!(response.is_refresh());
    assert_eq!(host.session_count(), 0);
}

#[tokio::test]
async fn test_rotated_identity_invalidates_the_old_one() {
    let (host, _) = host();
    let old = open(&host, "s1").await;
    let token = host.rotate_identity("s1").unwrap();

    let rejected = send(&host, "s1", &old, vec![]).await;
    assert_eq!(rejected, Packet::failure(markers::IDENTITY));

    let fresh = Headers::new(token, "v2");
    let accepted = send(&host, "s1", &fresh, vec![call("Counter", "read", vec![])]).await;
    assert_eq!(accepted.results(), &[Some(ExecResult::ok(json!(0)))]);
}

// ============================================================================
//  SESSIONS
// ============================================================================

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (host, _) = host();
    let a = open(&host, "a").await;
    let b = open(&host, "b").await;
    assert_ne!(a.identity, b.identity);

    send(&host, "a", &a, vec![call("Counter", "increment", vec![json!(5)])]).await;

    assert_eq!(host.inspect("a", "Counter", |n: &i64| *n).await.unwrap(), 5);
    assert_eq!(host.inspect("b", "Counter", |n: &i64| *n).await.unwrap(), 0);

    // A session's token is only good for that session.
    let crossed = send(&host, "b", &a, vec![]).await;
    assert_eq!(crossed, Packet::failure(markers::IDENTITY));
}

#[tokio::test]
async fn test_commands_before_bootstrap_are_not_ready() {
    let (host, _) = host();
    let session = host.get_or_create("early", true).unwrap().unwrap();
    assert_eq!(session.phase(), Phase::Uninitialized);

    let headers = Headers::new(host.identity("early").unwrap(), "v2");
    let response = send(&host, "early", &headers, vec![call("Counter", "read", vec![])]).await;
    assert_eq!(response.results(), &[Some(ExecResult::err(markers::NOT_READY))]);
}

#[tokio::test]
async fn test_later_bootstrap_reactivates_the_session() {
    let (host, journal) = host();
    let headers = open(&host, "s1").await;
    send(&host, "s1", &headers, vec![call("Counter", "increment", vec![json!(4)])]).await;

    let request = BootstrapRequest { features: vec!["Chart".into()] };
    let again = host.bootstrap("s1", request).await.unwrap();
    assert_eq!(again.names().collect::<Vec<_>>(), vec!["Counter", "Chart"]);
    assert_eq!(again.ctor_arguments[0]["identity"], json!(headers.identity.clone().unwrap()));

    assert_eq!(journal.count("construct:Counter"), 1);
    assert_eq!(journal.count("new_client:Counter"), 1);
    assert_eq!(journal.count("bootstrap_ready:Counter"), 1);
    assert_eq!(host.inspect("s1", "Counter", |n: &i64| *n).await.unwrap(), 4);
    assert_eq!(host.phase("s1"), Some(Phase::Ready));
}

#[tokio::test]
async fn test_racing_bootstraps_collapse_into_one() {
    let (host, journal) = host();

    let (a, b) = tokio::join!(
        host.bootstrap("s1", BootstrapRequest::default()),
        host.bootstrap("s1", BootstrapRequest::default()),
    );
    assert!(a.is_ok());
    assert!(matches!(b, Err(Error::Install(install::Error::AlreadyBootstrapped))));
    assert_eq!(journal.count("new_client:Counter"), 1);
    assert_eq!(host.phase("s1"), Some(Phase::Ready));
}

#[tokio::test]
async fn test_failing_constructor_caches_nothing() {
    let broken = Definition::library("Broken", || ())
        .on_construct(|_: &mut (), _input| Err(anyhow::anyhow!("no database")))
        .build();
    let host = Host::builder(HostConfig::new("v2")).register(broken).build().unwrap();

    let result = host.bootstrap("s1", BootstrapRequest::default()).await;
    assert!(matches!(result, Err(Error::Init(ref e)) if e.component == "Broken"));
    assert_eq!(host.session_count(), 0);
}

#[tokio::test]
async fn test_invoke_reaches_private_methods_and_pushes() {
    let (host, _) = host();
    let headers = open(&host, "s1").await;
    let mut pushed = host.subscribe("s1").unwrap();

    send(&host, "s1", &headers, vec![call("Counter", "increment", vec![json!(9)])]).await;
    host.invoke("s1", "Counter", "reset", vec![]).await.unwrap();
    assert_eq!(host.inspect("s1", "Counter", |n: &i64| *n).await.unwrap(), 0);

    host.invoke("s1", "Counter", "greet", vec![json!("hi")]).await.unwrap();
    let packet = pushed.recv().await.unwrap();
    assert_eq!(packet.commands, vec![call("Counter", "render", vec![json!("hi")])]);
}

#[tokio::test]
async fn test_destroy_and_idle_eviction() {
    let config = HostConfig::new("v2").with_idle_timeout(Some(Duration::ZERO));
    let (host, _) = host_with(config);
    open(&host, "a").await;
    open(&host, "b").await;

    assert!(host.destroy("a"));
    assert!(!host.destroy("a"));
    assert_eq!(host.session_count(), 1);

    assert_eq!(host.evict_idle(), 1);
    assert_eq!(host.session_count(), 0);
}

// ============================================================================
//  ROUND TRIPS
// ============================================================================

#[tokio::test]
async fn test_early_flush_and_reply_round_trip() {
    let (host, _) = host();
    let headers = open(&host, "s1").await;
    let mut pushed = host.subscribe("s1").unwrap();

    let first = send(&host, "s1", &headers, vec![call("Counter", "ask", vec![])]).await;
    assert_eq!(first.commands.len(), 1);
    assert_eq!(first.commands[0].cmd, "confirm");
    assert_eq!(first.results(), &[None]);
    let reply_id = first.commands[0].reply_id.expect("confirm needs a reply");

    let second = send(&host, "s1", &headers, vec![
        Command::reply(reply_id, ExecResult::ok(json!("yes"))),
    ]).await;
    assert_eq!(second.results(), &[Some(ExecResult::ok(Value::Null))]);
    assert!(second.commands.is_empty());

    let later = tokio::time::timeout(Duration::from_secs(1), pushed.recv()).await.unwrap().unwrap();
    assert_eq!(later.commands, vec![call("Counter", "render", vec![json!("yes")])]);
}

#[tokio::test]
async fn test_method_requested_install_is_announced() {
    let (host, _) = host();
    let headers = open(&host, "s1").await;

    let response = send(&host, "s1", &headers, vec![call("Counter", "open_chart", vec![])]).await;
    assert_eq!(response.commands.len(), 1);
    assert_eq!(response.commands[0].cmd, duorpc::INSTALL_COMPONENTS);
    assert_eq!(response.commands[0].args[0]["defs"][0]["name"], json!("Chart"));
    assert_eq!(response.commands[0].args[0]["defs"][0]["resources"], json!(["chart.css"]));

    let response = send(&host, "s1", &headers, vec![call("Chart", "plot", vec![json!(1), json!(2)])]).await;
    assert_eq!(response.results(), &[Some(ExecResult::ok(json!(2)))]);
}

#[tokio::test]
async fn test_rejected_install_fails_the_requesting_method() {
    let (host, _) = host();
    let headers = open(&host, "s1").await;

    let response = send(&host, "s1", &headers, vec![
        call("Counter", "open_vault", vec![]),
        call("Counter", "increment", vec![]),
    ]).await;
    assert_eq!(response.results(), &[
        Some(ExecResult::err(markers::INSTALL)),
        Some(ExecResult::ok(json!(1))),
    ]);
    assert!(response.commands.is_empty());

    let refused = host.invoke("s1", "Counter", "open_vault", vec![]).await;
    assert!(matches!(
        refused,
        Err(Error::Dispatch(dispatch::Error::Install { source: install::Error::Gated(ref name), .. })) if name == "Vault"
    ));
    assert_eq!(host.installed("s1").unwrap(), vec!["Counter"]);
}

#[tokio::test]
async fn test_hooks_cannot_install() {
    let eager = Definition::library("Eager", || ())
        .on_bootstrap_ready(|_: &mut (), ctx| {
            async move {
                ctx.install(["Chart"]);
                Ok(())
            }
            .boxed()
        })
        .build();
    let host = Host::builder(HostConfig::new("v2")).register(eager).register(chart()).build().unwrap();

    let result = host.bootstrap("s1", BootstrapRequest::default()).await;
    assert!(matches!(
        result,
        Err(Error::Install(install::Error::Hook { ref message, .. })) if message.contains("Chart")
    ));
    assert_eq!(host.session_count(), 0);
}

#[tokio::test]
async fn test_timed_out_batch_does_not_swallow_later_flushes() {
    let config = HostConfig::new("v2").with_task_timeout(Some(Duration::from_millis(30)));
    let (host, _) = host_with(config);
    let headers = open(&host, "s1").await;

    let timed_out = send(&host, "s1", &headers, vec![call("Counter", "slow", vec![])]).await;
    assert_eq!(timed_out, Packet::failure(markers::INTERNAL));

    let mut pushed = host.subscribe("s1").unwrap();
    host.invoke("s1", "Counter", "announce", vec![json!("hi")]).await.unwrap();
    let packet = tokio::time::timeout(Duration::from_secs(1), pushed.recv()).await.unwrap().unwrap();
    assert_eq!(packet.commands, vec![call("Counter", "render", vec![json!("hi")])]);
}
