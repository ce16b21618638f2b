use std::path::PathBuf;

use crate::error::OnErrorPolicy;

/// The "external key/subtree lookup service" collaborator (§6). The crate
/// never assumes a concrete directive-tree backend; callers wire in
/// whatever configuration system their host process already has.
pub trait ConfigStore: Send + Sync {
    /// Look up a single directive's first argument under `vhost`, e.g.
    /// `get("live", "hls.hls_fragment")`.
    fn get(&self, vhost: &str, directive: &str) -> Option<String>;
}

/// "Prefer-true" booleans: only the literal `off` is false, anything else
/// (including absence with a `true` default) is true.
fn parse_prefer_true(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some("off") => false,
        Some(_) => true,
        None => default,
    }
}

/// "Prefer-false" booleans: only the literal `on` is true.
fn parse_prefer_false(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some("on") => true,
        Some(_) => false,
        None => default,
    }
}

fn env_override(directive: &str) -> Option<String> {
    let key = format!("HLS_{}", directive.to_uppercase().replace('.', "_"));
    std::env::var(key).ok()
}

/// Apply an environment override on top of a directive-tree value: an
/// override always wins, but one that fails `validate` falls back to
/// `default` rather than propagating (§6 "documented bounds").
fn resolve<T: Clone>(
    directive: &str,
    from_tree: Option<T>,
    default: T,
    parse_env: impl Fn(&str) -> Option<T>,
    validate: impl Fn(&T) -> bool,
) -> T {
    if let Some(raw) = env_override(directive) {
        if let Some(v) = parse_env(&raw) {
            if validate(&v) {
                return v;
            }
        }
        return default;
    }
    from_tree.unwrap_or(default)
}

/// Mirrors every `hls.*` directive named in §6, assembled once per publish
/// (and again on hot reload) via [`HlsConfig::load`].
#[derive(Clone, Debug)]
pub struct HlsConfig {
    pub enabled: bool,
    pub fragment_secs: f64,
    pub window_secs: f64,
    pub path: PathBuf,
    pub m3u8_file: String,
    pub ts_file: String,
    pub fmp4_file: String,
    pub init_file: String,
    pub td_ratio: f64,
    pub aof_ratio: f64,
    pub on_error: OnErrorPolicy,
    pub cleanup: bool,
    pub wait_keyframe: bool,
    pub dispose_secs: f64,
    pub nb_notify: u32,
    pub dts_directly: bool,
    pub ts_floor: bool,
    pub keys: bool,
    pub fragments_per_key: u32,
    pub key_file: String,
    pub key_file_path: PathBuf,
    pub key_url: Option<String>,
    pub use_fmp4: bool,
    pub entry_prefix: Option<String>,
    pub ctx: Option<String>,
    pub ts_ctx: Option<String>,
    pub recover: bool,
}

impl HlsConfig {
    /// Smoothing constant for `is_segment_overflow`'s deviation term
    /// (original `SRS_HLS_FLOOR_REAP_PERCENT`).
    pub const FLOOR_REAP_PERCENT: f64 = 0.1;

    /// Pure-audio aggregation window before flushing into the active
    /// segment (§4.6).
    pub const PURE_AUDIO_AGGREGATE_MS: u64 = 200;

    pub fn load(store: &dyn ConfigStore, vhost: &str) -> crate::error::Result<Self> {
        let g = |d: &str| store.get(vhost, d);

        let enabled = parse_prefer_false(g("hls.enabled").as_deref(), false);
        let fragment_secs = resolve(
            "hls.hls_fragment",
            g("hls.hls_fragment").and_then(|v| v.parse().ok()),
            10.0,
            |s| s.parse().ok(),
            |v: &f64| *v > 0.0,
        );
        let window_secs = resolve(
            "hls.hls_window",
            g("hls.hls_window").and_then(|v| v.parse().ok()),
            60.0,
            |s| s.parse().ok(),
            |v: &f64| *v > 0.0,
        );
        let path = PathBuf::from(g("hls.hls_path").unwrap_or_else(|| "./objs/nginx/html".to_string()));
        let m3u8_file = g("hls.hls_m3u8_file").unwrap_or_else(|| "[app]/[stream].m3u8".to_string());
        let ts_file = g("hls.hls_ts_file").unwrap_or_else(|| "[app]/[stream]-[seq].ts".to_string());
        let fmp4_file = g("hls.hls_fmp4_file").unwrap_or_else(|| "[app]/[stream]-[seq].m4s".to_string());
        let init_file = g("hls.hls_init_file").unwrap_or_else(|| "[app]/[stream]-init.mp4".to_string());
        let td_ratio = resolve(
            "hls.hls_td_ratio",
            g("hls.hls_td_ratio").and_then(|v| v.parse().ok()),
            1.0,
            |s| s.parse().ok(),
            |v: &f64| *v > 0.0,
        );
        let aof_ratio = resolve(
            "hls.hls_aof_ratio",
            g("hls.hls_aof_ratio").and_then(|v| v.parse().ok()),
            2.1,
            |s| s.parse().ok(),
            |v: &f64| *v > 0.0,
        );
        let on_error = g("hls.hls_on_error")
            .as_deref()
            .and_then(OnErrorPolicy::parse)
            .unwrap_or_default();
        let cleanup = parse_prefer_true(g("hls.hls_cleanup").as_deref(), true);
        let wait_keyframe = parse_prefer_true(g("hls.hls_wait_keyframe").as_deref(), true);
        let dispose_secs = g("hls.hls_dispose").and_then(|v| v.parse().ok()).unwrap_or(0.0);
        let nb_notify = g("hls.hls_nb_notify").and_then(|v| v.parse().ok()).unwrap_or(64);
        let dts_directly = parse_prefer_false(g("hls.hls_dts_directly").as_deref(), false);
        let ts_floor = parse_prefer_false(g("hls.hls_ts_floor").as_deref(), false);
        let keys = parse_prefer_false(g("hls.hls_keys").as_deref(), false);
        let fragments_per_key = g("hls.hls_fragments_per_key").and_then(|v| v.parse().ok()).unwrap_or(5);
        let key_file = g("hls.hls_key_file").unwrap_or_else(|| "[app]/[stream]-[seq].key".to_string());
        let key_file_path = PathBuf::from(g("hls.hls_key_file_path").unwrap_or_else(|| "./objs/nginx/html".to_string()));
        let key_url = g("hls.hls_key_url");
        let use_fmp4 = parse_prefer_false(g("hls.hls_use_fmp4").as_deref(), false);
        let entry_prefix = g("hls.hls_entry_prefix");
        let ctx = g("hls.hls_ctx");
        let ts_ctx = g("hls.hls_ts_ctx");
        let recover = parse_prefer_false(g("hls.hls_recover").as_deref(), false);

        if fragment_secs <= 0.0 || window_secs <= 0.0 {
            return Err(crate::error::SegmenterError::ConfigInvalid(
                "hls_fragment and hls_window must be positive".to_string(),
            ));
        }

        Ok(HlsConfig {
            enabled,
            fragment_secs,
            window_secs,
            path,
            m3u8_file,
            ts_file,
            fmp4_file,
            init_file,
            td_ratio,
            aof_ratio,
            on_error,
            cleanup,
            wait_keyframe,
            dispose_secs,
            nb_notify,
            dts_directly,
            ts_floor,
            keys,
            fragments_per_key,
            key_file,
            key_file_path,
            key_url,
            use_fmp4,
            entry_prefix,
            ctx,
            ts_ctx,
            recover,
        })
    }
}

/// `config`-crate-backed [`ConfigStore`] for the standalone binary/tests:
/// layered defaults + YAML file + environment, flattened into `vhost.directive` keys.
pub struct StaticConfigStore {
    inner: config::Config,
}

impl StaticConfigStore {
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        let inner = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("HLS_STATIC").separator("__"))
            .build()
            .map_err(|e| crate::error::SegmenterError::ConfigInvalid(e.to_string()))?;
        Ok(StaticConfigStore { inner })
    }
}

impl ConfigStore for StaticConfigStore {
    fn get(&self, vhost: &str, directive: &str) -> Option<String> {
        let key = format!("{vhost}.{directive}");
        self.inner
            .get_string(&key)
            .ok()
            .or_else(|| self.inner.get_string(directive).ok())
    }
}
