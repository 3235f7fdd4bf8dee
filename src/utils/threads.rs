use std::thread::JoinHandle;

/// Spawns an OS thread with the given name so it shows up in debuggers and
/// panic messages identify themselves.
pub fn spawn_named_thread<F>(name: &str, f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("the OS refused to spawn a thread")
}
