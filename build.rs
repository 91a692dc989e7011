use std::{env, fs, path::Path};

/// A compile-time knob, read from `MEMTRACK_<name>`
struct Knob {
    name: &'static str,
    default: &'static str,
}

impl Knob {
    const fn new(name: &'static str, default: &'static str) -> Self {
        Self { name, default }
    }

    fn var(&self) -> String {
        let var = format!("MEMTRACK_{}", self.name);
        println!("cargo:rerun-if-env-changed={var}");
        env::var(&var).unwrap_or_else(|_| self.default.to_string())
    }

    fn usize(&self) -> usize {
        let raw = self.var();
        let n: usize = raw
            .trim()
            .parse()
            .unwrap_or_else(|_| panic!("MEMTRACK_{} must be an integer, got {raw:?}", self.name));
        assert!(n > 0, "MEMTRACK_{} must be at least 1", self.name);
        n
    }

    fn bool(&self) -> bool {
        match self.var().trim() {
            "1" | "on" | "yes" | "true" => true,
            "0" | "off" | "no" | "false" => false,
            other => panic!("MEMTRACK_{} must be on/off, got {other:?}", self.name),
        }
    }
}

fn main() {
    let max_threads = Knob::new("MAX_THREADS", "64").usize();
    let max_frames = Knob::new("MAX_FRAMES", "64").usize();
    let prefix = Knob::new("PREFIX", "MEMTRACKER").var();
    let trace_on_alloc = Knob::new("TRACE_ON_ALLOC", "on").bool();
    let trace_on_release = Knob::new("TRACE_ON_RELEASE", "off").bool();

    let out = Path::new(&env::var_os("OUT_DIR").unwrap()).join("config.rs");
    fs::write(
        &out,
        format!(
            "pub const MAX_THREADS: usize = {max_threads};\n\
             pub const MAX_FRAMES: usize = {max_frames};\n\
             pub const PREFIX: &str = {prefix:?};\n\
             pub const TRACE_ON_ALLOC: bool = {trace_on_alloc};\n\
             pub const TRACE_ON_RELEASE: bool = {trace_on_release};\n"
        ),
    )
    .unwrap();
    println!("cargo:rerun-if-changed=build.rs");
}
