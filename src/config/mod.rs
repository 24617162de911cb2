//! Settings for model storage, downloads and the device profile.
//!
//! Read from `$XDG_CONFIG_HOME/whisperdock/config.toml` (or
//! `~/.config/whisperdock/config.toml`). Every section is optional; a missing
//! file means built-in defaults. `whisperdock switch` writes the chosen model
//! back as `[model].default`.
//!
//! ```toml
//! [storage]
//! models_dir = "/data/whisper"       # managed root; HF caches are still scanned
//! extra_roots = ["/mnt/shared/models"]
//!
//! [download]
//! repo = "argmaxinc/whisperkit-coreml"
//! max_attempts = 4                   # first try included
//! base_delay_secs = 1                # waits 2s, 4s, 8s between attempts
//!
//! [device]
//! tier = "high"                      # low | mid | high
//! ```
//!
//! ```no_run
//! use whisperdock::config::Config;
//! use whisperdock::models::StorageRootResolver;
//!
//! let config = Config::load().expect("Failed to load config");
//! for root in StorageRootResolver::from_config(&config).unwrap().resolve_roots() {
//!     println!("{:<14} {}", root.convention, root.path.display());
//! }
//! ```

pub mod schema;

pub use schema::{config_path, Config};
