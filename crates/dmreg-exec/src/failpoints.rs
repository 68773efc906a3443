//! Chaos hooks (feature: `failpoints`).
//!
//! The macro expands to nothing unless the feature is enabled. When enabled,
//! points named `panic_*` panic and points named `delay_*` sleep briefly,
//! which widens race windows around the schema lock in stress runs.

#[cfg(feature = "failpoints")]
#[macro_export]
macro_rules! fail_point {
    ($name:expr) => {{
        let name: &str = $name;
        if name.starts_with("panic_") {
            panic!("failpoint triggered: {}", name);
        }
        if name.starts_with("delay_") {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }};
}

#[cfg(not(feature = "failpoints"))]
#[macro_export]
macro_rules! fail_point {
    ($name:expr) => {
        let _ = $name;
    };
}
