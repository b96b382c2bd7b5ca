//! # Module HTTP - Serveur embarqué minimaliste
//!
//! Ce module implémente le moteur HTTP/1.1 du runtime IONode : une seule
//! connexion en vol par instance, pas de TLS, pas de connexions
//! persistantes. Le protocole est analysé à la main, octet par octet,
//! comme il se doit sur une cible contrainte.
//!
//! ## Fonctionnalités
//!
//! - ✅ Analyse ligne de requête / en-têtes / arguments (GET et formulaires)
//! - ✅ Téléversements multipart livrés par tranches bornées
//! - ✅ Réponses à longueur explicite, inférée, ou par morceaux (chunked)
//! - ✅ Chaîne de handlers : pages à callback et fichiers statiques
//! - ✅ Aide à l'authentification Basic
//!
//! ## Architecture
//!
//! - [`HttpEngine`] : cycle de vie de la connexion, routage
//! - [`Transaction`] : état d'une requête servie et assemblage de la réponse
//! - [`HttpHandler`] : capacité de route ([`PageHandler`], [`FileHandler`])

use std::time::Duration;

mod engine;
mod errors;
mod handler;
mod multipart;
mod parser;
mod transaction;

pub use engine::{EngineState, HttpEngine, SharedHttpEngine, shared};
pub use errors::HttpError;
pub use handler::{
    FileHandler, HttpHandler, PageCallback, PageHandler, UploadCallback, content_type_for,
};
pub use parser::{HttpMethod, url_decode};
pub use transaction::{ContentLength, Stream, Transaction, Upload, UploadStatus};

/// Taille d'une tranche de diffusion de fichier.
pub const HTTP_DOWNLOAD_UNIT_SIZE: usize = 1460;

/// Taille du tampon de téléversement : une tranche livrée au handler.
pub const HTTP_UPLOAD_BUFLEN: usize = 2048;

/// Attente maximale des premiers octets d'un client.
pub const HTTP_MAX_DATA_WAIT: Duration = Duration::from_millis(1000);

/// Attente maximale du corps d'un POST.
pub const HTTP_MAX_POST_WAIT: Duration = Duration::from_millis(1000);

/// Attente maximale de l'acquittement d'une écriture.
pub const HTTP_MAX_SEND_WAIT: Duration = Duration::from_millis(5000);

/// Temps laissé au client pour fermer la connexion.
pub const HTTP_MAX_CLOSE_WAIT: Duration = Duration::from_millis(2000);

// Types MIME usuels
pub const MIME_TYPE_DATA: &str = "application/octet-stream";
pub const MIME_TYPE_GZIP: &str = "application/x-gzip";
pub const MIME_TYPE_TEXT: &str = "text/plain";
pub const MIME_TYPE_HTML: &str = "text/html";
pub const MIME_TYPE_JSON: &str = "application/json";
pub const MIME_TYPE_XML: &str = "text/xml";
