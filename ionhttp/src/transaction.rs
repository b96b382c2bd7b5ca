//! Transaction HTTP : l'état éphémère d'une connexion servie.
//!
//! Porte les arguments décodés, les en-têtes surveillés et l'assemblage de
//! la réponse (longueur explicite, inférée, ou transfert par morceaux).

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use tracing::debug;

use crate::parser::HttpMethod;
use crate::{
    HTTP_DOWNLOAD_UNIT_SIZE, HTTP_UPLOAD_BUFLEN, MIME_TYPE_DATA, MIME_TYPE_GZIP, MIME_TYPE_HTML,
};

/// Flux client : la socket en production, un tampon en test.
pub trait Stream: Read + Write {
    fn peer(&self) -> Option<SocketAddr> {
        None
    }
}

impl Stream for std::net::TcpStream {
    fn peer(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

/// État d'un téléversement multipart en cours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Start,
    Write,
    End,
    Aborted,
}

/// Descripteur du fichier en cours de téléversement.
///
/// Le tampon est borné à [`HTTP_UPLOAD_BUFLEN`] : il est livré au handler à
/// chaque remplissage, puis une dernière fois en fin de partie.
pub struct Upload {
    pub status: UploadStatus,
    pub name: String,
    pub filename: String,
    pub mime_type: String,
    pub total_size: usize,
    pub current_size: usize,
    pub buffer: Vec<u8>,
}

impl Upload {
    pub fn new(name: String, filename: String, mime_type: String) -> Self {
        Self {
            status: UploadStatus::Start,
            name,
            filename,
            mime_type,
            total_size: 0,
            current_size: 0,
            buffer: Vec::with_capacity(HTTP_UPLOAD_BUFLEN),
        }
    }
}

/// Longueur annoncée du corps de réponse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentLength {
    /// Non renseignée : inférée du corps passé à `send`
    NotSet,
    /// Inconnue d'avance : transfert par morceaux sur HTTP/1.1
    Unknown,
    /// Explicite
    Sized(usize),
}

/// Une requête analysée, liée à sa connexion, prête à répondre.
pub struct Transaction<'a> {
    client: &'a mut dyn Stream,
    method: HttpMethod,
    uri: String,
    version_minor: u8,
    args: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    host: String,
    upload: Option<Upload>,
    content_length: ContentLength,
    chunked: bool,
    response_headers: String,
}

impl<'a> Transaction<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: &'a mut dyn Stream,
        method: HttpMethod,
        uri: String,
        version_minor: u8,
        args: Vec<(String, String)>,
        headers: Vec<(String, String)>,
        host: String,
        upload: Option<Upload>,
    ) -> Self {
        Self {
            client,
            method,
            uri,
            version_minor,
            args,
            headers,
            host,
            upload,
            content_length: ContentLength::NotSet,
            chunked: false,
            response_headers: String::new(),
        }
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.client.peer()
    }

    /// Nombre d'arguments collectés (requête + corps).
    pub fn args(&self) -> usize {
        self.args.len()
    }

    /// Première valeur portant ce nom.
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_arg(&self, name: &str) -> bool {
        self.arg(name).is_some()
    }

    pub fn arg_at(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(|(_, v)| v.as_str())
    }

    pub fn arg_name(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(|(k, _)| k.as_str())
    }

    /// Valeur d'un en-tête surveillé (comparaison insensible à la casse).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn host_header(&self) -> &str {
        &self.host
    }

    pub fn upload(&self) -> Option<&Upload> {
        self.upload.as_ref()
    }

    /// Fixe la longueur du corps avant `send`. `Unknown` déclenche le
    /// transfert par morceaux sur un client HTTP/1.1.
    pub fn set_content_length(&mut self, length: ContentLength) {
        self.content_length = length;
    }

    /// Accumule un en-tête de réponse ; `first` le place en tête de liste.
    pub fn send_header(&mut self, name: &str, value: &str, first: bool) {
        let line = format!("{}: {}\r\n", name, value);
        if first {
            self.response_headers = line + &self.response_headers;
        } else {
            self.response_headers.push_str(&line);
        }
    }

    fn prepare_header(&mut self, code: u16, content_type: Option<&str>, body_len: usize) -> String {
        let mut response = format!(
            "HTTP/1.{} {} {}\r\n",
            self.version_minor,
            code,
            response_code_to_string(code)
        );

        let content_type = content_type.unwrap_or(MIME_TYPE_HTML);
        self.send_header("Content-Type", content_type, true);

        match self.content_length {
            ContentLength::NotSet => {
                self.send_header("Content-Length", &body_len.to_string(), false);
            }
            ContentLength::Sized(len) => {
                self.send_header("Content-Length", &len.to_string(), false);
            }
            ContentLength::Unknown => {
                if self.version_minor > 0 {
                    // Client HTTP/1.1 : transfert par morceaux
                    self.chunked = true;
                    self.send_header("Accept-Ranges", "none", false);
                    self.send_header("Transfer-Encoding", "chunked", false);
                }
            }
        }
        self.send_header("Connection", "close", false);

        response.push_str(&self.response_headers);
        response.push_str("\r\n");
        self.response_headers = String::new();
        response
    }

    /// Émet la ligne de statut, les en-têtes et le corps éventuel.
    pub fn send(&mut self, code: u16, content_type: Option<&str>, content: &str) -> io::Result<()> {
        let header = self.prepare_header(code, content_type, content.len());
        self.client.write_all(header.as_bytes())?;

        if !content.is_empty() {
            self.send_content(content.as_bytes())?;
        }

        debug!(
            "Served ({} {} {}): {:?} - {}",
            self.method.as_str(),
            code,
            response_code_to_string(code),
            self.client.peer(),
            self.uri
        );

        Ok(())
    }

    /// Émet un fragment de corps ; en mode morceaux, chaque appel produit un
    /// morceau préfixé de sa longueur en hexadécimal.
    pub fn send_content(&mut self, payload: &[u8]) -> io::Result<()> {
        if self.chunked {
            self.client
                .write_all(format!("{:x}\r\n", payload.len()).as_bytes())?;
        }

        self.client.write_all(payload)?;

        if self.chunked {
            self.client.write_all(b"\r\n")?;
        }

        Ok(())
    }

    /// Diffuse un fichier par tranches de [`HTTP_DOWNLOAD_UNIT_SIZE`] :
    /// longueur prise sur ses métadonnées, encodage gzip signalé quand on
    /// sert un `.gz` sous son type d'origine.
    pub fn stream_file(
        &mut self,
        file: &mut std::fs::File,
        content_type: &str,
        gzip_sibling: bool,
    ) -> io::Result<u64> {
        let len = file.metadata()?.len();
        self.set_content_length(ContentLength::Sized(len as usize));

        if gzip_sibling && content_type != MIME_TYPE_GZIP && content_type != MIME_TYPE_DATA {
            self.send_header("Content-Encoding", "gzip", false);
        }

        self.send(200, Some(content_type), "")?;

        let mut sent: u64 = 0;
        let mut unit = [0u8; HTTP_DOWNLOAD_UNIT_SIZE];
        loop {
            let n = file.read(&mut unit)?;
            if n == 0 {
                break;
            }
            self.client.write_all(&unit[..n])?;
            sent += n as u64;
        }

        Ok(sent)
    }

    /// Compare les identifiants à l'en-tête `Authorization: Basic …`.
    ///
    /// Ne rejette rien par elle-même : la décision reste à l'appelant.
    pub fn credentials(&self, username: &str, password: &str) -> bool {
        let Some(auth) = self.header("Authorization") else {
            return false;
        };

        let Some(encoded) = auth.strip_prefix("Basic") else {
            return false;
        };

        let expected = STANDARD.encode(format!("{}:{}", username, password));
        encoded.trim() == expected
    }

    /// Réclame une authentification Basic (401).
    pub fn request_authentication(&mut self) -> io::Result<()> {
        self.send_header("WWW-Authenticate", "Basic realm=\"Login Required\"", false);
        self.send(401, None, "")
    }
}

fn response_code_to_string(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Time-out",
        411 => "Length Required",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        415 => "Unsupported Media Type",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version not supported",
        _ => "",
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MockStream;
    use super::*;
    use crate::MIME_TYPE_TEXT;

    fn tx(stream: &mut MockStream) -> Transaction<'_> {
        Transaction::new(
            stream,
            HttpMethod::Get,
            "/".to_string(),
            1,
            Vec::new(),
            vec![("Authorization".to_string(), String::new())],
            String::new(),
            None,
        )
    }

    #[test]
    fn test_chunked_framing() {
        let mut stream = MockStream::new();
        let mut t = tx(&mut stream);
        t.set_content_length(ContentLength::Unknown);
        t.send(200, Some(MIME_TYPE_TEXT), "").unwrap();

        t.send_content(b"aaaaa").unwrap();
        t.send_content(b"").unwrap();
        t.send_content(b"bbbbbbbbbb").unwrap();

        let wire = String::from_utf8(stream.written).unwrap();
        let body = wire.splitn(2, "\r\n\r\n").nth(1).unwrap();
        assert_eq!(body, "5\r\naaaaa\r\n0\r\n\r\na\r\nbbbbbbbbbb\r\n");
    }

    #[test]
    fn test_chunked_header_advertised() {
        let mut stream = MockStream::new();
        let mut t = tx(&mut stream);
        t.set_content_length(ContentLength::Unknown);
        t.send(200, Some(MIME_TYPE_TEXT), "").unwrap();

        let wire = String::from_utf8(stream.written).unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Transfer-Encoding: chunked\r\n"));
        assert!(wire.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_http10_never_chunks() {
        let mut stream = MockStream::new();
        let mut t = Transaction::new(
            &mut stream,
            HttpMethod::Get,
            "/".to_string(),
            0,
            Vec::new(),
            Vec::new(),
            String::new(),
            None,
        );
        t.set_content_length(ContentLength::Unknown);
        t.send(200, Some(MIME_TYPE_TEXT), "").unwrap();

        let wire = String::from_utf8(stream.written).unwrap();
        assert!(!wire.contains("chunked"));
    }

    #[test]
    fn test_inferred_content_length() {
        let mut stream = MockStream::new();
        let mut t = tx(&mut stream);
        t.send(200, Some(MIME_TYPE_TEXT), "hello").unwrap();

        let wire = String::from_utf8(stream.written).unwrap();
        assert!(wire.contains("Content-Length: 5\r\n"));
        assert!(wire.ends_with("hello"));
    }

    #[test]
    fn test_content_type_is_first_header() {
        let mut stream = MockStream::new();
        let mut t = tx(&mut stream);
        t.send_header("X-Custom", "1", false);
        t.send(200, Some(MIME_TYPE_TEXT), "x").unwrap();

        let wire = String::from_utf8(stream.written).unwrap();
        let first_header = wire.lines().nth(1).unwrap();
        assert_eq!(first_header, "Content-Type: text/plain");
        assert!(wire.contains("X-Custom: 1\r\n"));
    }

    #[test]
    fn test_credentials_match() {
        let mut stream = MockStream::new();
        let encoded = STANDARD.encode("user:pass");
        let t = Transaction::new(
            &mut stream,
            HttpMethod::Get,
            "/".to_string(),
            1,
            Vec::new(),
            vec![("Authorization".to_string(), format!("Basic {}", encoded))],
            String::new(),
            None,
        );

        assert!(t.credentials("user", "pass"));
        assert!(!t.credentials("user", "wrong"));
    }

    #[test]
    fn test_credentials_without_header() {
        let mut stream = MockStream::new();
        let t = tx(&mut stream);
        assert!(!t.credentials("user", "pass"));
    }

    #[test]
    fn test_arg_lookup_first_wins() {
        let mut stream = MockStream::new();
        let t = Transaction::new(
            &mut stream,
            HttpMethod::Get,
            "/".to_string(),
            1,
            vec![
                ("k".to_string(), "1".to_string()),
                ("k".to_string(), "2".to_string()),
            ],
            Vec::new(),
            String::new(),
            None,
        );
        assert_eq!(t.arg("k"), Some("1"));
        assert_eq!(t.args(), 2);
        assert_eq!(t.arg_at(1), Some("2"));
    }
}
