//! Analyse des datagrammes M-SEARCH.
//!
//! Tokeniseur à états sur le datagramme reçu : les jetons sont délimités
//! par espaces ou deux-points selon l'état, et trois CR/LF consécutifs
//! terminent le message. Tout datagramme qui n'est pas
//! `M-SEARCH * HTTP/1.1`, ou dont l'en-tête `MAN` n'est pas exactement
//! `"ssdp:discover"`, est rejeté en silence.

use tracing::trace;

/// Requête de découverte, reconstruite à chaque datagramme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub search_target: String,
    pub max_wait: u32,
}

/// Résultat d'une extraction de jeton.
enum Token {
    Value(String),
    /// Trois CR/LF consécutifs : fin du message
    End,
    /// Plus rien à lire dans le datagramme
    Exhausted,
}

/// Curseur de jetons sur le datagramme.
struct TokenCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TokenCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Jeton suivant. Les espaces et deux-points de tête sont absorbés ;
    /// selon les drapeaux ils terminent le jeton ou en font partie.
    fn next_token(&mut self, break_on_space: bool, break_on_colon: bool) -> Token {
        let mut token = String::new();
        let mut token_found = false;
        let mut cr_found = 0;

        while self.pos < self.data.len() {
            let next = self.data[self.pos];
            self.pos += 1;

            match next {
                b'\r' | b'\n' => {
                    cr_found += 1;
                    if cr_found == 3 {
                        return Token::End;
                    }
                    if token_found {
                        return Token::Value(token);
                    }
                    continue;
                }
                b' ' => {
                    if !token_found {
                        cr_found = 0;
                        continue;
                    }
                    if break_on_space {
                        return Token::Value(token);
                    }
                    cr_found = 0;
                }
                b':' => {
                    if !token_found {
                        cr_found = 0;
                        continue;
                    }
                    if break_on_colon {
                        return Token::Value(token);
                    }
                    cr_found = 0;
                }
                _ => {
                    cr_found = 0;
                    token_found = true;
                }
            }

            token.push(next as char);
        }

        if token_found {
            Token::Value(token)
        } else {
            Token::Exhausted
        }
    }
}

/// États du tokeniseur d'en-têtes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    Start,
    Man,
    St,
    Mx,
    Unknown,
}

/// Analyse un datagramme de découverte ; `None` vaut silence.
pub fn parse_search(datagram: &[u8]) -> Option<SearchRequest> {
    let mut cursor = TokenCursor::new(datagram);

    // Méthode
    match cursor.next_token(true, false) {
        Token::Value(token) if token == "M-SEARCH" => {}
        Token::Value(token) => {
            trace!("REJECT method: {}", token);
            return None;
        }
        _ => return None,
    }

    // URI
    match cursor.next_token(true, false) {
        Token::Value(token) if token == "*" => {}
        Token::Value(token) => {
            trace!("REJECT URI: {}", token);
            return None;
        }
        _ => return None,
    }

    // Protocole (HTTP/1.1), absorbé jusqu'à la fin de ligne
    match cursor.next_token(false, false) {
        Token::Value(_) => {}
        _ => return None,
    }

    let mut state = HeaderState::Start;
    let mut search_target = String::new();
    let mut max_wait: u32 = 0;

    while !cursor.exhausted() {
        let at_start = state == HeaderState::Start;
        let token = match cursor.next_token(at_start, at_start) {
            Token::Value(token) => token,
            Token::End | Token::Exhausted => break,
        };

        state = match state {
            HeaderState::Start => {
                if token.eq_ignore_ascii_case("MAN") {
                    HeaderState::Man
                } else if token.eq_ignore_ascii_case("ST") {
                    HeaderState::St
                } else if token.eq_ignore_ascii_case("MX") {
                    HeaderState::Mx
                } else {
                    HeaderState::Unknown
                }
            }
            HeaderState::Man => {
                if token != "\"ssdp:discover\"" {
                    trace!("REJECT MAN: {}", token);
                    return None;
                }
                HeaderState::Start
            }
            HeaderState::St => {
                search_target = token;
                HeaderState::Start
            }
            HeaderState::Mx => {
                max_wait = token.trim().parse().unwrap_or(0);
                HeaderState::Start
            }
            HeaderState::Unknown => HeaderState::Start,
        };
    }

    trace!("SSDP: {} (MX={})", search_target, max_wait);

    Some(SearchRequest {
        search_target,
        max_wait,
    })
}
