use hashbrown::{HashMap, HashSet};
use lazy_static::lazy_static;
use std::env;
use std::sync::{Arc, RwLock};

/// Default values for the recognized configuration keys.
const INT_DEFAULTS: [(&str, i32); 8] = [
    ("ConnectionWindow", 120),
    ("ConnectionRetry", 5),
    ("RequestTimeout", 300),
    ("StreamErrorWindow", 1800),
    ("TimeoutResolution", 15),
    ("SubStreamsPerChannel", 1),
    ("DataServerTTL", 300),
    ("ManagerTTL", 3600),
];

const STRING_DEFAULTS: [(&str, &str); 1] = [("PollerPreference", "built-in")];

#[derive(Debug, Clone)]
enum Entry {
    Int(i32),
    Str(String),
}

struct EnvData {
    values: HashMap<String, Entry>,
    // Keys imported from the process environment; those shadow later puts.
    imported: HashSet<String>,
}

/// Client configuration store. Integer and string options keyed by name,
/// with each default overridable by an environment variable of the same
/// name uppercased and prefixed with `XRD_`.
pub struct Env {
    data: RwLock<EnvData>,
}

impl Env {
    pub fn new() -> Env {
        let env = Env {
            data: RwLock::new(EnvData {
                values: HashMap::new(),
                imported: HashSet::new(),
            }),
        };

        for &(key, value) in INT_DEFAULTS.iter() {
            env.put_int(key, value);
        }
        for &(key, value) in STRING_DEFAULTS.iter() {
            env.put_string(key, value);
        }

        for &(key, _) in INT_DEFAULTS.iter() {
            env.import_int(key);
        }
        for &(key, _) in STRING_DEFAULTS.iter() {
            env.import_string(key);
        }

        env
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        let data = self.data.read().unwrap();
        match data.values.get(key) {
            Some(Entry::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        let data = self.data.read().unwrap();
        match data.values.get(key) {
            Some(Entry::Str(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Store an integer option. Returns false if the key was imported from
    /// the process environment, in which case the variable wins.
    pub fn put_int(&self, key: &str, value: i32) -> bool {
        let mut data = self.data.write().unwrap();
        if data.imported.contains(key) {
            return false;
        }
        data.values.insert(key.to_string(), Entry::Int(value));
        true
    }

    /// Store a string option. Same shadowing rule as `put_int`.
    pub fn put_string(&self, key: &str, value: &str) -> bool {
        let mut data = self.data.write().unwrap();
        if data.imported.contains(key) {
            return false;
        }
        data.values
            .insert(key.to_string(), Entry::Str(value.to_string()));
        true
    }

    fn import_int(&self, key: &str) {
        if let Ok(raw) = env::var(Self::variable_name(key)) {
            if let Ok(value) = raw.trim().parse::<i32>() {
                let mut data = self.data.write().unwrap();
                data.values.insert(key.to_string(), Entry::Int(value));
                data.imported.insert(key.to_string());
            }
        }
    }

    fn import_string(&self, key: &str) {
        if let Ok(value) = env::var(Self::variable_name(key)) {
            let mut data = self.data.write().unwrap();
            data.values.insert(key.to_string(), Entry::Str(value));
            data.imported.insert(key.to_string());
        }
    }

    fn variable_name(key: &str) -> String {
        format!("XRD_{}", key.to_uppercase())
    }
}

impl Default for Env {
    fn default() -> Env {
        Env::new()
    }
}

lazy_static! {
    static ref DEFAULT_ENV: Arc<Env> = Arc::new(Env::new());
}

/// The process-wide default environment. Components still receive their
/// `Arc<Env>` explicitly; this is the instance used when the caller does
/// not care to build one.
pub fn default_env() -> Arc<Env> {
    DEFAULT_ENV.clone()
}
