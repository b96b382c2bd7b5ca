//! Chaîne de handlers consultée par le moteur HTTP.
//!
//! Les handlers sont parcourus dans l'ordre d'enregistrement ; le premier
//! dont `can_handle` accepte la paire (méthode, URI) sert la requête.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::parser::HttpMethod;
use crate::transaction::{Transaction, Upload};
use crate::{MIME_TYPE_DATA, MIME_TYPE_HTML};

/// Callback de page lié à une route.
pub type PageCallback = Box<dyn FnMut(&mut Transaction<'_>) + Send + Sync>;

/// Callback de réception d'upload, notifié à chaque étape du transfert.
pub type UploadCallback = Box<dyn FnMut(&Upload) + Send + Sync>;

/// Capacités d'une route.
pub trait HttpHandler: Send + Sync {
    /// Tag du propriétaire, pour le retrait groupé des routes d'une
    /// Function qui s'arrête.
    fn owner(&self) -> Option<&str> {
        None
    }

    fn can_handle(&self, method: HttpMethod, uri: &str) -> bool {
        let _ = (method, uri);
        false
    }

    fn can_upload(&self, uri: &str) -> bool {
        let _ = uri;
        false
    }

    fn handle(&mut self, tx: &mut Transaction<'_>, method: HttpMethod, uri: &str) -> bool {
        let _ = (tx, method, uri);
        false
    }

    fn upload(&mut self, uri: &str, upload: &Upload) {
        let _ = (uri, upload);
    }
}

/// Route liée à un callback : correspondance exacte URI + méthode.
pub struct PageHandler {
    uri: String,
    method: HttpMethod,
    callback: PageCallback,
    upload_callback: Option<UploadCallback>,
}

impl PageHandler {
    pub fn new(
        uri: &str,
        method: HttpMethod,
        callback: PageCallback,
        upload_callback: Option<UploadCallback>,
    ) -> Self {
        Self {
            uri: uri.to_string(),
            method,
            callback,
            upload_callback,
        }
    }
}

impl HttpHandler for PageHandler {
    fn can_handle(&self, method: HttpMethod, uri: &str) -> bool {
        if self.method != HttpMethod::Any && self.method != method {
            return false;
        }
        uri == self.uri
    }

    fn can_upload(&self, uri: &str) -> bool {
        self.upload_callback.is_some() && self.can_handle(HttpMethod::Post, uri)
    }

    fn handle(&mut self, tx: &mut Transaction<'_>, method: HttpMethod, uri: &str) -> bool {
        if !self.can_handle(method, uri) {
            return false;
        }
        (self.callback)(tx);
        true
    }

    fn upload(&mut self, uri: &str, upload: &Upload) {
        if self.can_upload(uri) {
            if let Some(cb) = self.upload_callback.as_mut() {
                cb(upload);
            }
        }
    }
}

/// Route statique : un préfixe d'URI projeté sur un répertoire.
///
/// Un URI de répertoire retombe sur `index.htm` ; quand le fichier demandé
/// n'existe pas mais qu'un frère `.gz` existe, ce dernier est servi avec
/// `Content-Encoding: gzip`.
pub struct FileHandler {
    base_uri: String,
    root: PathBuf,
    cache_header: Option<String>,
    is_file: bool,
}

impl FileHandler {
    pub fn new(base_uri: &str, root: &Path, cache_header: Option<&str>) -> Self {
        let is_file = root.is_file();
        debug!(
            "FileHandler: path={} uri={} is_file={}",
            root.display(),
            base_uri,
            is_file
        );

        Self {
            base_uri: base_uri.to_string(),
            root: root.to_path_buf(),
            cache_header: cache_header.map(str::to_string),
            is_file,
        }
    }
}

impl HttpHandler for FileHandler {
    fn can_handle(&self, method: HttpMethod, uri: &str) -> bool {
        if method != HttpMethod::Get {
            return false;
        }
        if self.is_file && uri != self.base_uri {
            return false;
        }
        uri.starts_with(&self.base_uri)
    }

    fn handle(&mut self, tx: &mut Transaction<'_>, method: HttpMethod, uri: &str) -> bool {
        if !self.can_handle(method, uri) {
            return false;
        }

        let mut path = self.root.clone();

        if !self.is_file {
            let mut rest = uri[self.base_uri.len()..].trim_start_matches('/').to_string();
            if rest.is_empty() || uri.ends_with('/') {
                rest.push_str("index.htm");
            }

            // Pas de remontée hors du répertoire servi
            if rest.split('/').any(|seg| seg == "..") {
                return false;
            }

            path.push(rest);
        }

        let content_type = content_type_for(&path);

        let mut gzip_sibling = false;
        if path.extension().and_then(|e| e.to_str()) != Some("gz") && !path.exists() {
            let with_gz = PathBuf::from(format!("{}.gz", path.display()));
            if with_gz.exists() {
                path = with_gz;
                gzip_sibling = true;
            }
        }

        let Ok(mut file) = File::open(&path) else {
            return false;
        };

        if let Some(cache) = &self.cache_header {
            tx.send_header("Cache-Control", cache, false);
        }

        tx.stream_file(&mut file, content_type, gzip_sibling).is_ok()
    }
}

/// Type MIME déduit de l'extension du chemin.
pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => MIME_TYPE_HTML,
        Some("css") => "text/css",
        Some("txt") => "text/plain",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("xml") => "text/xml",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/x-gzip",
        _ => MIME_TYPE_DATA,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::HttpMethod;
    use crate::transaction::test_support::MockStream;
    use crate::transaction::Transaction;
    use std::fs;

    fn get_tx<'a>(stream: &'a mut MockStream, uri: &str) -> Transaction<'a> {
        Transaction::new(
            stream,
            HttpMethod::Get,
            uri.to_string(),
            1,
            Vec::new(),
            Vec::new(),
            String::new(),
            None,
        )
    }

    fn temp_mount(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("ionhttp-mount-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_file_served_with_content_type() {
        let dir = temp_mount("serve");
        fs::write(dir.join("app.json"), b"{\"ok\":true}").unwrap();

        let mut handler = FileHandler::new("/static", &dir, None);
        let mut stream = MockStream::new();
        let mut tx = get_tx(&mut stream, "/static/app.json");

        assert!(handler.handle(&mut tx, HttpMethod::Get, "/static/app.json"));
        let wire = String::from_utf8(stream.written).unwrap();
        assert!(wire.contains("Content-Type: application/json\r\n"));
        assert!(wire.ends_with("{\"ok\":true}"));
    }

    #[test]
    fn test_gz_sibling_substitution() {
        let dir = temp_mount("gz");
        // Seul le frère compressé existe
        fs::write(dir.join("app.js.gz"), b"gzbytes").unwrap();

        let mut handler = FileHandler::new("/static", &dir, None);
        let mut stream = MockStream::new();
        let mut tx = get_tx(&mut stream, "/static/app.js");

        assert!(handler.handle(&mut tx, HttpMethod::Get, "/static/app.js"));
        let wire = String::from_utf8(stream.written).unwrap();
        assert!(wire.contains("Content-Encoding: gzip\r\n"));
        assert!(wire.contains("Content-Type: application/javascript\r\n"));
    }

    #[test]
    fn test_directory_uri_falls_back_to_index() {
        let dir = temp_mount("index");
        fs::write(dir.join("index.htm"), b"<html>home</html>").unwrap();

        let mut handler = FileHandler::new("/", &dir, None);
        let mut stream = MockStream::new();
        let mut tx = get_tx(&mut stream, "/");

        assert!(handler.handle(&mut tx, HttpMethod::Get, "/"));
        let wire = String::from_utf8(stream.written).unwrap();
        assert!(wire.ends_with("<html>home</html>"));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let dir = temp_mount("traversal");

        let mut handler = FileHandler::new("/static", &dir, None);
        let mut stream = MockStream::new();
        let mut tx = get_tx(&mut stream, "/static/../secret");

        assert!(!handler.handle(&mut tx, HttpMethod::Get, "/static/../secret"));
        assert!(stream.written.is_empty());
    }

    #[test]
    fn test_cache_header_emitted() {
        let dir = temp_mount("cache");
        fs::write(dir.join("a.txt"), b"x").unwrap();

        let mut handler = FileHandler::new("/static", &dir, Some("max-age=3600"));
        let mut stream = MockStream::new();
        let mut tx = get_tx(&mut stream, "/static/a.txt");

        assert!(handler.handle(&mut tx, HttpMethod::Get, "/static/a.txt"));
        let wire = String::from_utf8(stream.written).unwrap();
        assert!(wire.contains("Cache-Control: max-age=3600\r\n"));
    }

    #[test]
    fn test_missing_file_falls_through() {
        let dir = temp_mount("missing");
        let mut handler = FileHandler::new("/static", &dir, None);
        let mut stream = MockStream::new();
        let mut tx = get_tx(&mut stream, "/static/nope.txt");

        assert!(!handler.handle(&mut tx, HttpMethod::Get, "/static/nope.txt"));
    }

    #[test]
    fn test_page_handler_exact_match() {
        let handler = PageHandler::new(
            "/status",
            HttpMethod::Get,
            Box::new(|_tx| {}),
            None,
        );

        assert!(handler.can_handle(HttpMethod::Get, "/status"));
        assert!(!handler.can_handle(HttpMethod::Post, "/status"));
        assert!(!handler.can_handle(HttpMethod::Get, "/status/x"));
    }

    #[test]
    fn test_page_handler_any_method() {
        let handler = PageHandler::new("/x", HttpMethod::Any, Box::new(|_tx| {}), None);
        assert!(handler.can_handle(HttpMethod::Delete, "/x"));
    }

    #[test]
    fn test_page_handler_upload_requires_callback() {
        let without = PageHandler::new("/up", HttpMethod::Post, Box::new(|_tx| {}), None);
        assert!(!without.can_upload("/up"));

        let with = PageHandler::new(
            "/up",
            HttpMethod::Post,
            Box::new(|_tx| {}),
            Some(Box::new(|_u| {})),
        );
        assert!(with.can_upload("/up"));
        assert!(!with.can_upload("/other"));
    }

    #[test]
    fn test_file_handler_prefix_match() {
        let dir = std::env::temp_dir().join(format!("ionhttp-files-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let handler = FileHandler::new("/static", &dir, None);

        assert!(handler.can_handle(HttpMethod::Get, "/static/app.js"));
        assert!(!handler.can_handle(HttpMethod::Post, "/static/app.js"));
        assert!(!handler.can_handle(HttpMethod::Get, "/other"));
    }

    #[test]
    fn test_content_type_table() {
        assert_eq!(content_type_for(Path::new("a.html")), "text/html");
        assert_eq!(content_type_for(Path::new("a.json")), "application/json");
        assert_eq!(content_type_for(Path::new("a.gz")), "application/x-gzip");
        assert_eq!(content_type_for(Path::new("a.bin")), MIME_TYPE_DATA);
    }
}
