//! Moteur HTTP : cycle de vie d'une connexion servie par pas de service.
//!
//! Une seule connexion est en vol à la fois. Les longues attentes (arrivée
//! des données, du corps POST, fermeture du client) sont des vérifications
//! de temps écoulé re-testées au prochain pas, jamais des blocages ouverts.

use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::errors::HttpError;
use crate::handler::{FileHandler, HttpHandler, PageCallback, PageHandler, UploadCallback};
use crate::multipart;
use crate::parser::{self, HttpMethod, WireReader};
use crate::transaction::{Transaction, Upload};
use crate::{
    HTTP_MAX_CLOSE_WAIT, HTTP_MAX_DATA_WAIT, HTTP_MAX_POST_WAIT, HTTP_MAX_SEND_WAIT,
    MIME_TYPE_TEXT,
};

/// Poignée de partage du moteur entre le Master et les devices co-portés.
pub type SharedHttpEngine = Arc<RwLock<HttpEngine>>;

/// Enrobe un moteur dans sa poignée partageable.
pub fn shared(engine: HttpEngine) -> SharedHttpEngine {
    Arc::new(RwLock::new(engine))
}

/// État global du moteur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
    Error,
}

/// Phase de la connexion courante.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientStatus {
    Idle,
    WaitRead,
    WaitClose,
}

/// Serveur HTTP minimaliste, une connexion à la fois.
pub struct HttpEngine {
    tag: String,
    port: u16,
    state: EngineState,
    listener: Option<TcpListener>,
    conn: Option<TcpStream>,
    status: ClientStatus,
    status_change: Instant,
    handlers: Vec<Box<dyn HttpHandler>>,
    not_found: Option<PageCallback>,
    header_keys: Vec<String>,
}

impl HttpEngine {
    pub fn new(tag: &str, port: u16) -> Self {
        info!("Created HTTP ({}) server", port);

        Self {
            tag: tag.to_string(),
            port,
            state: EngineState::Stopped,
            listener: None,
            conn: None,
            status: ClientStatus::Idle,
            status_change: Instant::now(),
            handlers: Vec::new(),
            not_found: None,
            header_keys: vec!["Authorization".to_string()],
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Port effectivement lié (utile quand le port demandé était 0).
    pub fn bound_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Fixe la liste des en-têtes à collecter. `Authorization` est toujours
    /// surveillé ; le reste est ignoré pour garder la mémoire bornée.
    pub fn collect_headers(&mut self, keys: &[&str]) {
        self.header_keys = std::iter::once("Authorization".to_string())
            .chain(keys.iter().map(|k| k.to_string()))
            .collect();
    }

    /// Route exacte, toutes méthodes confondues.
    pub fn on(&mut self, uri: &str, callback: PageCallback) {
        self.on_method(uri, HttpMethod::Any, callback);
    }

    /// Route exacte pour une méthode donnée.
    pub fn on_method(&mut self, uri: &str, method: HttpMethod, callback: PageCallback) {
        debug!("On handler: {}", uri);
        self.add_handler(Box::new(PageHandler::new(uri, method, callback, None)));
    }

    /// Route de téléversement : callback de page + callback d'upload.
    pub fn on_upload(
        &mut self,
        uri: &str,
        method: HttpMethod,
        callback: PageCallback,
        upload: UploadCallback,
    ) {
        self.add_handler(Box::new(PageHandler::new(uri, method, callback, Some(upload))));
    }

    /// Montage statique d'un répertoire.
    pub fn serve_files(&mut self, uri: &str, root: &Path, cache_header: Option<&str>) {
        self.add_handler(Box::new(FileHandler::new(uri, root, cache_header)));
    }

    /// Handler arbitraire, ajouté en fin de chaîne.
    pub fn add_handler(&mut self, handler: Box<dyn HttpHandler>) {
        self.handlers.push(handler);
    }

    /// Retire toutes les routes enregistrées par ce propriétaire.
    pub fn remove_handlers_by_owner(&mut self, owner: &str) {
        self.handlers.retain(|h| h.owner() != Some(owner));
    }

    /// Nombre de routes enregistrées.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Callback appelé quand aucune route n'accepte la requête.
    pub fn on_not_found(&mut self, callback: PageCallback) {
        self.not_found = Some(callback);
    }

    /// Ouvre le port d'écoute.
    pub fn startup(&mut self) -> Result<(), HttpError> {
        if self.state != EngineState::Stopped {
            return Ok(());
        }

        info!("Starting HTTP server: {}", self.port);

        let listener = TcpListener::bind(("0.0.0.0", self.port)).map_err(|source| {
            self.state = EngineState::Error;
            warn!("❌ Failed to bind HTTP port {}", self.port);
            HttpError::Bind {
                port: self.port,
                source,
            }
        })?;
        listener.set_nonblocking(true)?;

        self.listener = Some(listener);
        self.status = ClientStatus::Idle;
        self.state = EngineState::Running;

        info!("✅ HTTP server started on port {}", self.port);
        Ok(())
    }

    /// Ferme l'écoute et lâche la connexion en cours.
    pub fn shutdown(&mut self) {
        if self.state == EngineState::Stopped {
            return;
        }

        info!("Stopping HTTP server ({})", self.port);
        self.listener = None;
        self.conn = None;
        self.status = ClientStatus::Idle;
        self.state = EngineState::Stopped;
    }

    /// Un pas de service : avance la machine à états de la connexion.
    pub fn service(&mut self) {
        if self.state != EngineState::Running {
            return;
        }

        if self.status == ClientStatus::Idle {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((stream, peer)) => {
                    trace!("Client connected: {}", peer);
                    if stream.set_nonblocking(true).is_err() {
                        return;
                    }
                    self.conn = Some(stream);
                    self.status = ClientStatus::WaitRead;
                    self.status_change = Instant::now();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("Accept failed: {}", e);
                    return;
                }
            }
        }

        if self.status == ClientStatus::WaitRead {
            let mut probe = [0u8; 1];
            let ready = match self.conn.as_ref().map(|c| c.peek(&mut probe)) {
                Some(Ok(0)) => {
                    // Fermé avant d'avoir parlé
                    self.drop_connection();
                    return;
                }
                Some(Ok(_)) => true,
                Some(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => false,
                Some(Err(_)) | None => {
                    self.drop_connection();
                    return;
                }
            };

            if !ready {
                if self.status_change.elapsed() > HTTP_MAX_DATA_WAIT {
                    self.drop_connection();
                }
                return;
            }

            // Des octets sont là : analyse bornée puis traitement
            let mut stream = self.conn.take().expect("connection present in WaitRead");
            let keep = match self.handle_connection(&mut stream) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Parsing request failed: {}", e);
                    false
                }
            };

            if keep && stream.set_nonblocking(true).is_ok() {
                self.conn = Some(stream);
                self.status = ClientStatus::WaitClose;
                self.status_change = Instant::now();
            } else {
                self.conn = None;
                self.status = ClientStatus::Idle;
            }
            return;
        }

        if self.status == ClientStatus::WaitClose {
            let mut probe = [0u8; 1];
            match self.conn.as_ref().map(|c| c.peek(&mut probe)) {
                Some(Ok(0)) | Some(Err(_)) | None => {
                    self.drop_connection();
                }
                _ => {
                    if self.status_change.elapsed() > HTTP_MAX_CLOSE_WAIT {
                        self.drop_connection();
                    }
                }
            }
        }
    }

    fn drop_connection(&mut self) {
        self.conn = None;
        self.status = ClientStatus::Idle;
    }

    /// Analyse la requête sur la socket et la route vers un handler.
    ///
    /// Toute erreur de format abandonne l'échange sans réponse : la socket
    /// est simplement rendue au fossé.
    fn handle_connection(&mut self, stream: &mut TcpStream) -> Result<(), HttpError> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(HTTP_MAX_POST_WAIT))?;
        stream.set_write_timeout(Some(HTTP_MAX_SEND_WAIT))?;

        let mut rdr = WireReader::new(&mut *stream);

        let head = parser::parse_request_line(&rdr.read_line()?)?;
        debug!(
            tag = %self.tag,
            "Method: {} URL: {} Search: {}",
            head.method.as_str(),
            head.uri,
            head.query
        );

        // Handler attaché dès la ligne de requête : le chemin d'upload en a
        // besoin pendant l'analyse du corps
        let handler_idx = self
            .handlers
            .iter()
            .position(|h| h.can_handle(head.method, &head.uri));

        let mut headers: Vec<(String, String)> = self
            .header_keys
            .iter()
            .map(|k| (k.clone(), String::new()))
            .collect();

        let mut host = String::new();
        let mut content_type = String::new();
        let mut content_length: usize = 0;

        loop {
            let line = rdr.read_line()?;
            if line.is_empty() {
                break;
            }

            let Some(div) = line.find(':') else {
                break;
            };
            let name = line[..div].trim();
            let value = line[div + 1..].trim();
            trace!("Header: {} = {}", name, value);

            for (k, v) in headers.iter_mut() {
                if k.eq_ignore_ascii_case(name) {
                    *v = value.to_string();
                }
            }

            if name.eq_ignore_ascii_case("Content-Type") {
                content_type = value.to_string();
            } else if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value.parse().unwrap_or(0);
            } else if name.eq_ignore_ascii_case("Host") {
                host = value.to_string();
            }
        }

        let mut args: Vec<(String, String)> = Vec::new();
        let mut upload: Option<Upload> = None;

        if head.method.carries_body() {
            let is_multipart = content_type.starts_with("multipart/");
            let is_encoded = content_type.starts_with("application/x-www-form-urlencoded");

            if is_multipart {
                let boundary = content_type
                    .split('=')
                    .nth(1)
                    .map(str::to_string)
                    .ok_or_else(|| HttpError::BadRequest("missing boundary".into()))?;

                parser::parse_arguments(&head.query, &mut args);

                let handler = match handler_idx {
                    Some(i) => Some(self.handlers[i].as_mut()),
                    None => None,
                };
                upload = multipart::parse_form(&mut rdr, handler, &head.uri, &boundary, &mut args)?;
            } else {
                let body = rdr.read_up_to(content_length)?;
                if body.len() < content_length {
                    return Err(HttpError::BodyTimeout);
                }

                let mut search = head.query.clone();
                if is_encoded && !body.is_empty() {
                    if !search.is_empty() {
                        search.push('&');
                    }
                    search.push_str(&parser::url_decode(&String::from_utf8_lossy(&body)));
                }
                parser::parse_arguments(&search, &mut args);

                if !is_encoded && content_length > 0 {
                    // Corps brut (JSON ou autre) exposé comme argument unique
                    args.push((
                        "plain".to_string(),
                        String::from_utf8_lossy(&body).into_owned(),
                    ));
                }
            }
        } else {
            parser::parse_arguments(&head.query, &mut args);
        }

        drop(rdr);

        let mut tx = Transaction::new(
            stream,
            head.method,
            head.uri.clone(),
            head.version_minor,
            args,
            headers,
            host,
            upload,
        );

        let mut handled = false;
        if let Some(idx) = handler_idx {
            handled = self.handlers[idx].handle(&mut tx, head.method, &head.uri);
            if !handled {
                trace!("Request handler failed to handle request");
            }
        }

        if !handled {
            if let Some(not_found) = self.not_found.as_mut() {
                not_found(&mut tx);
            } else {
                let _ = tx.send(
                    404,
                    Some(MIME_TYPE_TEXT),
                    &format!("Not found: {}", head.uri),
                );
            }
        }

        Ok(())
    }
}
