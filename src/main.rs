use shim::builtin;
use shim::example::ExampleManager;
use shim::plugin::Registry;

const RUNTIME_NAME: &str = "io.containerd.example.v1";

fn main() {
    let mut registry = Registry::new();
    if let Err(e) = builtin::register_optional(&mut registry) {
        eprintln!("shim: {RUNTIME_NAME}: {e}");
        shim::config::shim_exit(1);
        return;
    }

    shim::run(ExampleManager::new(RUNTIME_NAME), registry, Vec::new());
}
