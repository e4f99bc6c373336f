use std::sync::{Arc, Mutex};

use termport::{Fault, HandlerRegistry, Term};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A small embedded-runtime surface: arithmetic and string helpers plus
/// one function that calls back into the peer on every iteration.
///
/// Returns the registry and the sink `utils:print_string` writes into.
pub fn util_registry() -> (HandlerRegistry, Arc<Mutex<Vec<String>>>) {
    let printed: Arc<Mutex<Vec<String>>> = Arc::default();
    let mut registry = HandlerRegistry::new();

    registry.register_fn("utils", "identity", 1, |_caller, mut args| async move {
        Ok(args.remove(0))
    });

    registry.register_fn("utils", "add", 2, |_caller, args| async move {
        match (args[0].as_integer(), args[1].as_integer()) {
            (Some(a), Some(b)) => Ok(Term::int(a + b)),
            _ => Err(Fault::message("add expects integers")),
        }
    });

    registry.register_fn("utils", "len", 1, |_caller, args| async move {
        let n = match &args[0] {
            Term::List(elements) => elements.len(),
            Term::Str(s) => s.chars().count(),
            Term::Binary(bytes) => bytes.len(),
            _ => return Err(Fault::message("len expects a sequence")),
        };
        Ok(Term::int(n as i64))
    });

    let sink = Arc::clone(&printed);
    registry.register_fn("utils", "print_string", 1, move |_caller, args| {
        let sink = Arc::clone(&sink);
        async move {
            let text = args[0]
                .as_charlist()
                .ok_or_else(|| Fault::message("print_string expects a charlist"))?;
            sink.lock().unwrap().push(text);
            Ok(Term::atom("ok"))
        }
    });

    // Feeds each callback the previous callback's return value, then
    // returns the iteration count, not the last result.
    registry.register_fn("utils", "switch", 1, |caller, args| async move {
        let n = args[0]
            .as_integer()
            .ok_or_else(|| Fault::message("switch expects an integer"))?;
        let mut result = Term::int(0);
        for i in 0..n {
            result = caller
                .call("harness", "test_callback", vec![result, Term::int(i)])
                .await
                .map_err(|e| Fault::message(format!("callback failed: {}", e)))?;
        }
        Ok(Term::int(n))
    });

    (registry, printed)
}
