//! Analyse des corps `multipart/form-data`.
//!
//! Machine à états explicite sur un flux d'octets : les champs texte
//! deviennent des arguments (lignes re-jointes par `\n`), les fichiers sont
//! livrés au handler par tranches de [`HTTP_UPLOAD_BUFLEN`] octets, avec les
//! transitions `Start → Write×N → End` (ou `Aborted` sur déconnexion).

use std::io::Read;

use tracing::{debug, trace};

use crate::HTTP_UPLOAD_BUFLEN;
use crate::errors::HttpError;
use crate::handler::HttpHandler;
use crate::parser::WireReader;
use crate::transaction::{Upload, UploadStatus};

/// États du scanner de corps multipart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormState {
    ExpectBoundary,
    PartHeaders,
    FieldValue,
    FileBytes,
    Done,
}

/// Livraison bufferisée des octets d'un fichier vers le handler.
struct UploadSink<'h, 'u> {
    handler: Option<&'h mut (dyn HttpHandler + 'static)>,
    uri: &'u str,
    upload: Upload,
}

impl<'h, 'u> UploadSink<'h, 'u> {
    fn deliver(&mut self) {
        if let Some(handler) = self.handler.as_mut() {
            if handler.can_upload(self.uri) {
                handler.upload(self.uri, &self.upload);
            }
        }
    }

    /// Écrit un octet ; un tampon plein est livré avant d'être réutilisé.
    fn push(&mut self, byte: u8) {
        if self.upload.current_size == HTTP_UPLOAD_BUFLEN {
            self.deliver();
            self.upload.total_size += self.upload.current_size;
            self.upload.current_size = 0;
            self.upload.buffer.clear();
        }
        self.upload.buffer.push(byte);
        self.upload.current_size += 1;
    }

    fn start(&mut self) {
        self.upload.status = UploadStatus::Start;
        self.deliver();
        self.upload.status = UploadStatus::Write;
    }

    /// Fin de partie : dernière tranche puis transition `End`.
    fn finish(&mut self) {
        self.deliver();
        self.upload.total_size += self.upload.current_size;
        self.upload.status = UploadStatus::End;
        self.deliver();

        debug!(
            "End File: {} Type: {} Size: {}",
            self.upload.filename, self.upload.mime_type, self.upload.total_size
        );
    }

    fn abort(&mut self) {
        self.upload.status = UploadStatus::Aborted;
        self.deliver();
    }
}

/// Champs extraits d'un en-tête `Content-Disposition`.
fn parse_disposition(line: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut filename = None;

    for part in line.split(';') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("name=") {
            name = Some(v.trim_matches('"').to_string());
        } else if let Some(v) = part.strip_prefix("filename=") {
            filename = Some(v.trim_matches('"').to_string());
        }
    }

    (name, filename)
}

/// Analyse un corps multipart complet.
///
/// `args` contient déjà les arguments de la chaîne de recherche ; les
/// champs texte y sont ajoutés. Le handler sélectionné (s'il y en a un)
/// reçoit les tranches de fichier. Retourne l'upload final pour que la
/// transaction puisse l'exposer au handler.
pub(crate) fn parse_form<R: Read>(
    rdr: &mut WireReader<R>,
    mut handler: Option<&mut (dyn HttpHandler + 'static)>,
    uri: &str,
    boundary: &str,
    args: &mut Vec<(String, String)>,
) -> Result<Option<Upload>, HttpError> {
    let full_boundary = format!("--{}", boundary);
    let closing_boundary = format!("--{}--", boundary);

    let mut state = FormState::ExpectBoundary;
    let mut part_name = String::new();
    let mut part_filename: Option<String> = None;
    let mut part_mime = String::from("text/plain");
    let mut last_upload: Option<Upload> = None;

    // Le préambule peut contenir des lignes vides avant la frontière
    let mut retry = 0;
    while state == FormState::ExpectBoundary {
        let line = rdr.read_line()?;
        if line.is_empty() {
            retry += 1;
            if retry >= 3 {
                return Err(HttpError::BadRequest("missing multipart boundary".into()));
            }
            continue;
        }
        if line == full_boundary {
            state = FormState::PartHeaders;
        } else if line == closing_boundary {
            state = FormState::Done;
        } else {
            debug!("Unexpected multipart preamble: {}", line);
            return Err(HttpError::BadRequest("bad multipart boundary".into()));
        }
    }

    while state != FormState::Done {
        match state {
            FormState::PartHeaders => {
                part_name.clear();
                part_filename = None;
                part_mime = String::from("text/plain");

                loop {
                    let line = rdr.read_line()?;
                    if line.is_empty() {
                        break;
                    }

                    let lower = line.to_ascii_lowercase();
                    if lower.starts_with("content-disposition") {
                        let (name, filename) = parse_disposition(&line);
                        if let Some(n) = name {
                            part_name = n;
                        }
                        part_filename = filename;
                    } else if lower.starts_with("content-type") {
                        if let Some(pos) = line.find(':') {
                            part_mime = line[pos + 1..].trim().to_string();
                        }
                    }
                }

                state = if part_filename.is_some() {
                    FormState::FileBytes
                } else {
                    FormState::FieldValue
                };
            }

            FormState::FieldValue => {
                trace!("POST Arg, Name: {}", part_name);

                let mut value = String::new();
                loop {
                    let line = rdr.read_line()?;
                    if line.starts_with(&full_boundary) {
                        args.push((part_name.clone(), value));
                        state = if line == closing_boundary {
                            FormState::Done
                        } else {
                            FormState::PartHeaders
                        };
                        break;
                    }
                    if !value.is_empty() {
                        value.push('\n');
                    }
                    value.push_str(&line);
                }
            }

            FormState::FileBytes => {
                let mut filename = part_filename.clone().unwrap_or_default();

                // Upload de type blob : le nom vient d'un argument dédié
                if filename == "blob" {
                    if let Some((_, v)) = args.iter().find(|(k, _)| k == "filename") {
                        filename = v.clone();
                    }
                }

                trace!("Start File: {} Type: {}", filename, part_mime);

                let mut sink = UploadSink {
                    handler: handler.as_mut().map(|h| &mut **h),
                    uri,
                    upload: Upload::new(part_name.clone(), filename, part_mime.clone()),
                };
                sink.start();

                match scan_file_bytes(rdr, &mut sink, boundary) {
                    Ok(done) => {
                        sink.finish();
                        last_upload = Some(sink.upload);
                        state = if done {
                            FormState::Done
                        } else {
                            FormState::PartHeaders
                        };
                    }
                    Err(e) => {
                        sink.abort();
                        return Err(e);
                    }
                }
            }

            FormState::ExpectBoundary | FormState::Done => unreachable!(),
        }
    }

    Ok(last_upload)
}

/// Balaye les octets d'un fichier jusqu'à la frontière de fin de partie.
///
/// Retourne `true` quand la frontière rencontrée était terminale (`--`).
/// Les faux débuts de frontière (CR/LF/tirets isolés) sont réinjectés dans
/// le flux de sortie.
fn scan_file_bytes<R: Read>(
    rdr: &mut WireReader<R>,
    sink: &mut UploadSink<'_, '_>,
    boundary: &str,
) -> Result<bool, HttpError> {
    let boundary_bytes = boundary.as_bytes();
    let mut byte = rdr.read_byte_required()?;

    loop {
        if byte != 0x0D {
            sink.push(byte);
            byte = rdr.read_byte_required()?;
            continue;
        }

        let b2 = rdr.read_byte_required()?;
        if b2 != 0x0A {
            sink.push(0x0D);
            byte = b2;
            continue;
        }

        let b3 = rdr.read_byte_required()?;
        if b3 != b'-' {
            sink.push(0x0D);
            sink.push(0x0A);
            byte = b3;
            continue;
        }

        let b4 = rdr.read_byte_required()?;
        if b4 != b'-' {
            sink.push(0x0D);
            sink.push(0x0A);
            sink.push(b'-');
            byte = b4;
            continue;
        }

        let mut tail = vec![0u8; boundary_bytes.len()];
        rdr.read_exact_buf(&mut tail)?;

        if tail == boundary_bytes {
            // Fin de partie ; la ligne restante dit si le corps est clos
            let rest = rdr.read_line()?;
            return Ok(rest == "--");
        }

        sink.push(0x0D);
        sink.push(0x0A);
        sink.push(b'-');
        sink.push(b'-');
        for b in tail {
            sink.push(b);
        }
        byte = rdr.read_byte_required()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::HttpMethod;
    use crate::transaction::Transaction;

    /// Handler de test : enregistre chaque événement d'upload.
    struct RecordingHandler {
        events: Vec<(UploadStatus, usize, usize)>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self { events: Vec::new() }
        }
    }

    impl HttpHandler for RecordingHandler {
        fn can_handle(&self, _method: HttpMethod, _uri: &str) -> bool {
            true
        }

        fn can_upload(&self, _uri: &str) -> bool {
            true
        }

        fn handle(&mut self, _tx: &mut Transaction<'_>, _m: HttpMethod, _u: &str) -> bool {
            true
        }

        fn upload(&mut self, _uri: &str, upload: &Upload) {
            self.events
                .push((upload.status, upload.current_size, upload.total_size));
        }
    }

    fn body(boundary: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, filename, data) in parts {
            out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            match filename {
                Some(f) => out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, f
                    )
                    .as_bytes(),
                ),
                None => out.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                ),
            }
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        out
    }

    #[test]
    fn test_text_field_becomes_argument() {
        let data = body("XYZ", &[("name", None, b"value")]);
        let mut rdr = WireReader::new(&data[..]);
        let mut args = Vec::new();
        let mut handler = RecordingHandler::new();

        parse_form(&mut rdr, Some(&mut handler), "/up", "XYZ", &mut args).unwrap();

        assert_eq!(args, vec![("name".to_string(), "value".to_string())]);
        assert!(handler.events.is_empty());
    }

    #[test]
    fn test_field_value_preserves_embedded_newlines() {
        let data = body("XYZ", &[("text", None, b"line1\r\nline2")]);
        let mut rdr = WireReader::new(&data[..]);
        let mut args = Vec::new();

        parse_form(&mut rdr, None, "/up", "XYZ", &mut args).unwrap();

        assert_eq!(args[0].1, "line1\nline2");
    }

    #[test]
    fn test_file_of_buflen_plus_one_flushes_twice() {
        let payload = vec![0x41u8; HTTP_UPLOAD_BUFLEN + 1];
        let data = body(
            "XYZ",
            &[
                ("name", None, b"value"),
                ("file", Some("data.bin"), &payload),
            ],
        );
        let mut rdr = WireReader::new(&data[..]);
        let mut args = Vec::new();
        let mut handler = RecordingHandler::new();

        parse_form(&mut rdr, Some(&mut handler), "/up", "XYZ", &mut args).unwrap();

        // Un argument texte capturé
        assert_eq!(args, vec![("name".to_string(), "value".to_string())]);

        // Start, deux écritures (tampon plein + fin de partie), End
        let statuses: Vec<UploadStatus> = handler.events.iter().map(|(s, _, _)| *s).collect();
        assert_eq!(
            statuses,
            vec![
                UploadStatus::Start,
                UploadStatus::Write,
                UploadStatus::Write,
                UploadStatus::End
            ]
        );

        // Premier flush plein, second avec l'octet restant
        assert_eq!(handler.events[1].1, HTTP_UPLOAD_BUFLEN);
        assert_eq!(handler.events[2].1, 1);

        // Taille totale exacte après End
        assert_eq!(handler.events[3].2, HTTP_UPLOAD_BUFLEN + 1);
    }

    #[test]
    fn test_file_bytes_with_embedded_crlf_and_dashes() {
        let payload = b"head\r\nbody--not-a-boundary\r\n-tail";
        let data = body("BND", &[("f", Some("x.bin"), payload)]);
        let mut rdr = WireReader::new(&data[..]);
        let mut args = Vec::new();
        let mut handler = RecordingHandler::new();

        parse_form(&mut rdr, Some(&mut handler), "/up", "BND", &mut args).unwrap();

        // Le total doit valoir la taille exacte du contenu
        let end = handler
            .events
            .iter()
            .find(|(s, _, _)| *s == UploadStatus::End)
            .unwrap();
        assert_eq!(end.2, payload.len());
    }

    #[test]
    fn test_two_text_fields() {
        let data = body("B", &[("a", None, b"1"), ("b", None, b"2")]);
        let mut rdr = WireReader::new(&data[..]);
        let mut args = Vec::new();

        parse_form(&mut rdr, None, "/up", "B", &mut args).unwrap();

        assert_eq!(args.len(), 2);
        assert_eq!(args[1], ("b".to_string(), "2".to_string()));
    }

    #[test]
    fn test_client_disconnect_aborts_upload() {
        // Corps tronqué au milieu des octets du fichier
        let mut data = body("B", &[("f", Some("x.bin"), b"payload")]);
        data.truncate(data.len() - 12);

        let mut rdr = WireReader::new(&data[..]);
        let mut args = Vec::new();
        let mut handler = RecordingHandler::new();

        let result = parse_form(&mut rdr, Some(&mut handler), "/up", "B", &mut args);

        assert!(result.is_err());
        let aborted: Vec<_> = handler
            .events
            .iter()
            .filter(|(s, _, _)| *s == UploadStatus::Aborted)
            .collect();
        assert_eq!(aborted.len(), 1);
    }

    #[test]
    fn test_blob_filename_substitution() {
        let data = body("B", &[("f", Some("blob"), b"x")]);
        let mut rdr = WireReader::new(&data[..]);
        let mut args = vec![("filename".to_string(), "real.bin".to_string())];
        let mut handler = RecordingHandler::new();

        let upload = parse_form(&mut rdr, Some(&mut handler), "/up", "B", &mut args)
            .unwrap()
            .unwrap();
        assert_eq!(upload.filename, "real.bin");
    }

    #[test]
    fn test_parse_disposition() {
        let (name, filename) =
            parse_disposition("Content-Disposition: form-data; name=\"f\"; filename=\"a.txt\"");
        assert_eq!(name.as_deref(), Some("f"));
        assert_eq!(filename.as_deref(), Some("a.txt"));

        let (name, filename) = parse_disposition("Content-Disposition: form-data; name=\"k\"");
        assert_eq!(name.as_deref(), Some("k"));
        assert!(filename.is_none());
    }
}
