//! Links over real transports: TCP and Unix sockets.

mod common;

use std::sync::Arc;

use termport::{BridgeListener, BridgeStream, HandlerRegistry, Link, LinkConfig, Term};

#[tokio::test]
async fn tcp_end_to_end() -> anyhow::Result<()> {
    common::init_tracing();
    let listener = BridgeListener::bind_tcp("127.0.0.1:0".parse()?).await?;
    let endpoint = listener.endpoint().clone();

    let (accepted, connected) =
        tokio::try_join!(listener.accept(), BridgeStream::connect(&endpoint))?;

    let (utils, _) = common::util_registry();
    let serving = Link::over_stream(accepted, Arc::new(utils), LinkConfig::default());
    let calling = Link::over_stream(
        connected,
        Arc::new(HandlerRegistry::new()),
        LinkConfig::default(),
    );

    let result = calling
        .handle()
        .call("utils", "add", vec![Term::int(19), Term::int(23)])
        .await?;
    assert_eq!(result, Term::int(42));

    calling.shutdown().await;
    serving.shutdown().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn unix_end_to_end() -> anyhow::Result<()> {
    common::init_tracing();
    let dir = tempfile::tempdir()?;
    let listener = BridgeListener::bind_unix(dir.path().join("bridge.sock")).await?;
    let endpoint = listener.endpoint().clone();

    let (accepted, connected) =
        tokio::try_join!(listener.accept(), BridgeStream::connect(&endpoint))?;

    let (utils, _) = common::util_registry();
    let serving = Link::over_stream(accepted, Arc::new(utils), LinkConfig::default());
    let calling = Link::over_stream(
        connected,
        Arc::new(HandlerRegistry::new()),
        LinkConfig::default(),
    );

    let result = calling
        .handle()
        .call("utils", "len", vec![Term::charlist("hello")])
        .await?;
    assert_eq!(result, Term::int(5));

    calling.shutdown().await;
    serving.shutdown().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn auto_bound_socket_directory_is_cleaned_up() -> anyhow::Result<()> {
    common::init_tracing();
    let listener = BridgeListener::bind_unix_auto().await?;
    let termport::EndpointInfo::Unix { path } = listener.endpoint().clone() else {
        panic!("auto bind produced a non-unix endpoint");
    };
    assert!(path.exists());
    drop(listener);
    assert!(!path.exists());
    Ok(())
}

#[tokio::test]
async fn endpoint_survives_the_env_handoff_format() -> anyhow::Result<()> {
    // The parent exports to_env_value() into the child's environment; the
    // child parses it back. Exercise the serialized form both ways.
    let listener = BridgeListener::bind_tcp("127.0.0.1:0".parse()?).await?;
    let exported = listener.endpoint().to_env_value()?;
    let parsed = termport::EndpointInfo::parse(&exported)?;

    let (accepted, connected) =
        tokio::try_join!(listener.accept(), BridgeStream::connect(&parsed))?;

    let (utils, _) = common::util_registry();
    let serving = Link::over_stream(accepted, Arc::new(utils), LinkConfig::default());
    let calling = Link::over_stream(
        connected,
        Arc::new(HandlerRegistry::new()),
        LinkConfig::default(),
    );

    let result = calling
        .handle()
        .call("utils", "identity", vec![Term::atom("handoff")])
        .await?;
    assert_eq!(result, Term::atom("handoff"));

    calling.shutdown().await;
    serving.shutdown().await;
    Ok(())
}
