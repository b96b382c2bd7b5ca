//! Magasin clé/valeur persistant.
//!
//! Le [`Store`] est le support de persistance du modèle d'entités : chaque
//! Function y range ses valeurs sous un espace de noms portant son tag,
//! comme le ferait une partition NVS sur le matériel d'origine. Les
//! appelants ne voient jamais le support disque, uniquement le contrat
//! get/set par clé.
//!
//! Un échec d'écriture disque est journalisé et la valeur reste en mémoire :
//! l'opération est considérée réussie du point de vue de l'appelant.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Result;
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

const STORE_FILE: &str = "state.yaml";

struct StoreInner {
    path: PathBuf,
    data: Mutex<Mapping>,
}

/// Magasin d'état persistant, partageable par clonage.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Ouvre (ou crée) le magasin dans le répertoire donné.
    pub fn open(directory: &str) -> Result<Self> {
        let path = Path::new(directory).join(STORE_FILE);

        let data = match fs::read_to_string(&path) {
            Ok(text) => match serde_yaml::from_str::<Value>(&text) {
                Ok(Value::Mapping(map)) => map,
                Ok(_) | Err(_) => {
                    warn!(file = %path.display(), "Corrupt state file, starting empty");
                    Mapping::new()
                }
            },
            Err(_) => Mapping::new(),
        };

        debug!(file = %path.display(), "State store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                data: Mutex::new(data),
            }),
        })
    }

    /// Lit une valeur chaîne.
    pub fn get(&self, namespace: &str, key: &str) -> Option<String> {
        let data = self.inner.data.lock().unwrap();
        match Self::entry(&data, namespace, key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Lit une valeur entière.
    pub fn get_i64(&self, namespace: &str, key: &str) -> Option<i64> {
        let data = self.inner.data.lock().unwrap();
        match Self::entry(&data, namespace, key) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Écrit une valeur chaîne, puis persiste.
    pub fn set(&self, namespace: &str, key: &str, value: &str) {
        self.set_value(namespace, key, Value::String(value.to_string()));
    }

    /// Écrit une valeur entière, puis persiste.
    pub fn set_i64(&self, namespace: &str, key: &str, value: i64) {
        self.set_value(namespace, key, Value::Number(value.into()));
    }

    /// Supprime une clé d'un espace de noms.
    pub fn remove(&self, namespace: &str, key: &str) {
        {
            let mut data = self.inner.data.lock().unwrap();
            if let Some(Value::Mapping(ns)) = data.get_mut(&Value::String(namespace.to_string())) {
                ns.remove(&Value::String(key.to_string()));
            }
        }
        self.flush();
    }

    /// Efface tout un espace de noms (retour usine d'une Function).
    pub fn remove_namespace(&self, namespace: &str) {
        {
            let mut data = self.inner.data.lock().unwrap();
            data.remove(&Value::String(namespace.to_string()));
        }
        self.flush();
    }

    /// Réécrit le fichier d'état. L'échec est toléré : la valeur reste en
    /// mémoire et l'erreur est journalisée.
    pub fn flush(&self) {
        let data = self.inner.data.lock().unwrap();
        let text = match serde_yaml::to_string(&Value::Mapping(data.clone())) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize state store: {}", e);
                return;
            }
        };
        drop(data);

        if let Err(e) = fs::write(&self.inner.path, text) {
            warn!(file = %self.inner.path.display(), "Failed to persist state store: {}", e);
        }
    }

    fn set_value(&self, namespace: &str, key: &str, value: Value) {
        {
            let mut data = self.inner.data.lock().unwrap();
            let ns_key = Value::String(namespace.to_string());
            let ns = data
                .entry(ns_key)
                .or_insert(Value::Mapping(Mapping::new()));
            if let Value::Mapping(map) = ns {
                map.insert(Value::String(key.to_string()), value);
            }
        }
        self.flush();
    }

    fn entry<'a>(data: &'a Mapping, namespace: &str, key: &str) -> Option<&'a Value> {
        match data.get(&Value::String(namespace.to_string())) {
            Some(Value::Mapping(ns)) => ns.get(&Value::String(key.to_string())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> Store {
        let dir = std::env::temp_dir().join(format!("ionode-store-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let _ = fs::remove_file(dir.join(STORE_FILE));
        Store::open(dir.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_roundtrip_string() {
        let store = temp_store("roundtrip");
        store.set("fn1", "Value@P000", "on");
        assert_eq!(store.get("fn1", "Value@P000").as_deref(), Some("on"));
    }

    #[test]
    fn test_roundtrip_i64() {
        let store = temp_store("i64");
        store.set_i64("fn1", "Time@P000", 1721651234);
        assert_eq!(store.get_i64("fn1", "Time@P000"), Some(1721651234));
    }

    #[test]
    fn test_missing_key_is_none() {
        let store = temp_store("missing");
        assert_eq!(store.get("nobody", "nothing"), None);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let store = temp_store("isolated");
        store.set("a", "k", "1");
        store.set("b", "k", "2");
        assert_eq!(store.get("a", "k").as_deref(), Some("1"));
        assert_eq!(store.get("b", "k").as_deref(), Some("2"));
    }

    #[test]
    fn test_remove_namespace() {
        let store = temp_store("reset");
        store.set("dev", "Value@P000", "uuid-x");
        store.set("dev", "Value@P001", "/schema.xml");
        store.remove_namespace("dev");
        assert_eq!(store.get("dev", "Value@P000"), None);
        assert_eq!(store.get("dev", "Value@P001"), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("ionode-store-reopen-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let _ = fs::remove_file(dir.join(STORE_FILE));

        {
            let store = Store::open(dir.to_str().unwrap()).unwrap();
            store.set("fn1", "Label", "porch light");
        }
        let store = Store::open(dir.to_str().unwrap()).unwrap();
        assert_eq!(store.get("fn1", "Label").as_deref(), Some("porch light"));
    }
}
