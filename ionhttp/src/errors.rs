//! Erreurs du moteur HTTP.

use thiserror::Error;

/// Erreurs liées au traitement d'une connexion HTTP.
#[derive(Error, Debug)]
pub enum HttpError {
    /// Erreur d'entrée/sortie sur la socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Ligne de requête ou en-tête inexploitable
    #[error("Malformed request: {0}")]
    BadRequest(String),

    /// Corps incomplet dans le délai d'attente POST
    #[error("Request body incomplete")]
    BodyTimeout,

    /// Le client a fermé la connexion en cours d'échange
    #[error("Client disconnected")]
    Disconnected,

    /// Le port d'écoute n'a pas pu être ouvert
    #[error("Failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
}
