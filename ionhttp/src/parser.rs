//! Analyse du format filaire HTTP/1.x.
//!
//! Les lecteurs sont génériques sur [`std::io::Read`] : le moteur les
//! instancie sur la socket TCP, les tests sur des tranches d'octets.

use std::io::Read;

use crate::errors::HttpError;

/// Méthodes HTTP supportées par le moteur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Any,
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl HttpMethod {
    /// Décode le jeton de méthode ; tout jeton inconnu vaut GET, comme le
    /// ferait un navigateur face à un serveur minimaliste.
    pub fn from_token(token: &str) -> Self {
        match token {
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "PATCH" => Self::Patch,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            _ => Self::Get,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "ANY",
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }

    /// Les méthodes porteuses d'un corps de requête.
    pub fn carries_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
    }
}

/// Première ligne d'une requête, décomposée.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: HttpMethod,
    pub uri: String,
    pub query: String,
    pub version_minor: u8,
}

/// Découpe `METHOD SP path[?query] SP HTTP/1.x`.
///
/// La chaîne de recherche est retournée décodée ; le chemin est laissé tel
/// quel. Une ligne qui ne porte pas deux espaces est rejetée.
pub fn parse_request_line(line: &str) -> Result<RequestLine, HttpError> {
    let mut parts = line.splitn(3, ' ');
    let method_str = parts.next().unwrap_or("");
    let url = parts
        .next()
        .ok_or_else(|| HttpError::BadRequest(line.to_string()))?;
    let version = parts
        .next()
        .ok_or_else(|| HttpError::BadRequest(line.to_string()))?;

    if method_str.is_empty() || url.is_empty() {
        return Err(HttpError::BadRequest(line.to_string()));
    }

    let version_minor = version
        .strip_prefix("HTTP/1.")
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(0);

    let (uri, query) = match url.find('?') {
        Some(pos) => (url[..pos].to_string(), url_decode(&url[pos + 1..])),
        None => (url.to_string(), String::new()),
    };

    Ok(RequestLine {
        method: HttpMethod::from_token(method_str),
        uri,
        query,
        version_minor,
    })
}

/// Décode les séquences `%xx` et les `+` d'une chaîne URL.
pub fn url_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(b) => {
                        decoded.push(b);
                        i += 3;
                    }
                    Err(_) => {
                        decoded.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            b => {
                decoded.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

/// Ajoute à `args` les paires `clé=valeur` d'une chaîne `a=1&b=2`.
///
/// Les clés en double sont conservées, l'ordre d'apparition aussi. Un
/// segment sans `=` est ignoré.
pub fn parse_arguments(data: &str, args: &mut Vec<(String, String)>) {
    if data.is_empty() {
        return;
    }

    for pair in data.split('&') {
        if let Some(eq) = pair.find('=') {
            args.push((pair[..eq].to_string(), pair[eq + 1..].to_string()));
        }
    }
}

/// Lecteur filaire bufferisé, octet par octet.
///
/// Tolère les clients qui terminent leurs lignes par un LF nu. La fin de
/// flux en milieu de ligne rend la ligne partielle ; une fin de flux sur
/// ligne vide est une déconnexion.
pub struct WireReader<R: Read> {
    inner: R,
    buf: [u8; 512],
    start: usize,
    end: usize,
    eof: bool,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: [0u8; 512],
            start: 0,
            end: 0,
            eof: false,
        }
    }

    fn fill(&mut self) -> Result<(), HttpError> {
        if self.start < self.end || self.eof {
            return Ok(());
        }
        self.start = 0;
        self.end = 0;
        match self.inner.read(&mut self.buf) {
            Ok(0) => {
                self.eof = true;
                Ok(())
            }
            Ok(n) => {
                self.end = n;
                Ok(())
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(HttpError::BodyTimeout)
            }
            Err(e) => Err(HttpError::Io(e)),
        }
    }

    /// Octet suivant, `None` sur fin de flux.
    pub fn read_byte(&mut self) -> Result<Option<u8>, HttpError> {
        self.fill()?;
        if self.start < self.end {
            let b = self.buf[self.start];
            self.start += 1;
            Ok(Some(b))
        } else {
            Ok(None)
        }
    }

    /// Octet suivant, déconnexion = erreur (flux d'upload).
    pub fn read_byte_required(&mut self) -> Result<u8, HttpError> {
        self.read_byte()?.ok_or(HttpError::Disconnected)
    }

    /// Lit une ligne terminée par LF, CR final retiré.
    pub fn read_line(&mut self) -> Result<String, HttpError> {
        let mut line = Vec::new();

        loop {
            match self.read_byte()? {
                Some(b'\n') => break,
                Some(b) => line.push(b),
                None => {
                    if line.is_empty() {
                        return Err(HttpError::Disconnected);
                    }
                    break;
                }
            }
        }

        if line.last() == Some(&b'\r') {
            line.pop();
        }

        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Remplit `out` exactement, ou échoue sur déconnexion.
    pub fn read_exact_buf(&mut self, out: &mut [u8]) -> Result<(), HttpError> {
        for slot in out.iter_mut() {
            *slot = self.read_byte_required()?;
        }
        Ok(())
    }

    /// Lit jusqu'à `len` octets ; s'arrête sur fin de flux.
    pub fn read_up_to(&mut self, len: usize) -> Result<Vec<u8>, HttpError> {
        let mut out = Vec::with_capacity(len.min(16 * 1024));
        while out.len() < len {
            match self.read_byte()? {
                Some(b) => out.push(b),
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_with_query() {
        let head = parse_request_line("GET /set?k1=v1&k2=v2 HTTP/1.1").unwrap();
        assert_eq!(head.method, HttpMethod::Get);
        assert_eq!(head.uri, "/set");
        assert_eq!(head.query, "k1=v1&k2=v2");
        assert_eq!(head.version_minor, 1);
    }

    #[test]
    fn test_request_line_without_query() {
        let head = parse_request_line("POST /upload HTTP/1.0").unwrap();
        assert_eq!(head.method, HttpMethod::Post);
        assert_eq!(head.uri, "/upload");
        assert_eq!(head.query, "");
        assert_eq!(head.version_minor, 0);
    }

    #[test]
    fn test_request_line_unknown_method_is_get() {
        let head = parse_request_line("BREW /pot HTTP/1.1").unwrap();
        assert_eq!(head.method, HttpMethod::Get);
    }

    #[test]
    fn test_request_line_malformed() {
        assert!(parse_request_line("GET").is_err());
        assert!(parse_request_line("GET /x").is_err());
        assert!(parse_request_line("").is_err());
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("a%20b+c"), "a b c");
        assert_eq!(url_decode("100%25"), "100%");
        assert_eq!(url_decode("plain"), "plain");
        // séquence % tronquée laissée telle quelle
        assert_eq!(url_decode("x%2"), "x%2");
    }

    #[test]
    fn test_parse_arguments_order_and_duplicates() {
        let mut args = Vec::new();
        parse_arguments("k1=v1&k2=v2&k1=v3", &mut args);
        assert_eq!(
            args,
            vec![
                ("k1".to_string(), "v1".to_string()),
                ("k2".to_string(), "v2".to_string()),
                ("k1".to_string(), "v3".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_arguments_skips_missing_value() {
        let mut args = Vec::new();
        parse_arguments("novalue&k=v", &mut args);
        assert_eq!(args, vec![("k".to_string(), "v".to_string())]);
    }

    #[test]
    fn test_wire_reader_lines_bare_lf() {
        let data = b"first\r\nsecond\nthird";
        let mut rdr = WireReader::new(&data[..]);
        assert_eq!(rdr.read_line().unwrap(), "first");
        assert_eq!(rdr.read_line().unwrap(), "second");
        assert_eq!(rdr.read_line().unwrap(), "third");
        assert!(rdr.read_line().is_err());
    }

    #[test]
    fn test_wire_reader_read_up_to_stops_at_eof() {
        let data = b"abc";
        let mut rdr = WireReader::new(&data[..]);
        assert_eq!(rdr.read_up_to(10).unwrap(), b"abc");
    }
}
