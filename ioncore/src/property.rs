//! Propriétés typées du modèle d'entités.
//!
//! Une propriété est une valeur scalaire ou chaîne, étiquetée, drapeautée
//! et horodatée, détenue par exactement une Function. La hiérarchie de
//! classes du firmware d'origine est remplacée par un jeu fermé de
//! variantes étiquetées : le type de donnée découle de la variante.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};

/// Longueur maximale d'une étiquette de propriété.
pub const PROPERTY_MAX_LABEL: usize = 48;

// Drapeaux des propriétés et des functions (bitset u16)
pub const FLAG_SENSOR: u16 = 0x0001;
pub const FLAG_CONTROL: u16 = 0x0002;
pub const FLAG_READ_ONLY: u16 = 0x0008;
pub const FLAG_VOLATILE: u16 = 0x0010;
pub const FLAG_SYSTEM: u16 = 0x0200;
pub const FLAG_CONFIG: u16 = 0x0400;
pub const FLAG_LOCK_LABEL: u16 = 0x0800;
pub const FLAG_DISABLED: u16 = 0x1000;
pub const FLAG_RESTART: u16 = 0x8000;

/// Type de donnée d'une propriété, aligné sur les types UPnP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Text,
    Number,
    Bool,
    Enum,
    Date,
    Stream,
}

/// Classe sémantique : ce que la valeur représente pour un contrôleur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyClass {
    Generic,
    Mode,
    Time,
    Timezone,
    MsTimer,
    IpHost,
    Ip4Address,

    AmbientTemperature,
    Brightness,
    Current,
    Frequency,
    Illuminance,
    Pressure,
    RelativeHumidity,
    Voltage,

    Boolean,
    Motion,
    Logic,
    Switch,
    Outlet,
    Relay,
    Valve,

    Light,
    LightDimmer,
}

/// Charge utile d'une propriété.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text {
        value: String,
        capacity: usize,
    },
    Int {
        value: i64,
        min: i64,
        max: i64,
    },
    Float {
        value: f64,
        min: f64,
        max: f64,
    },
    Bool(bool),
    Enum {
        index: usize,
        choices: Vec<String>,
    },
    Date(Option<DateTime<Utc>>),
    Stream(Vec<u8>),
}

/// Valeur typée, drapeautée et persistée d'une Function.
#[derive(Debug, Clone)]
pub struct Property {
    class: PropertyClass,
    flags: u16,
    label: Option<String>,
    prefix: Option<String>,
    suffix: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    value: PropertyValue,
}

impl Property {
    fn new(flags: u16, class: PropertyClass, value: PropertyValue) -> Self {
        Self {
            class,
            flags,
            label: None,
            prefix: None,
            suffix: None,
            timestamp: None,
            value,
        }
    }

    /// Propriété chaîne, tronquée à `capacity` caractères.
    pub fn text(flags: u16, class: PropertyClass, default: &str, capacity: usize) -> Self {
        let mut value = default.to_string();
        value.truncate(capacity);
        Self::new(flags, class, PropertyValue::Text { value, capacity })
    }

    /// Propriété entière, bornée à `[min, max]`.
    pub fn int(flags: u16, class: PropertyClass, value: i64, min: i64, max: i64) -> Self {
        Self::new(
            flags,
            class,
            PropertyValue::Int {
                value: value.clamp(min, max),
                min,
                max,
            },
        )
    }

    /// Propriété flottante, bornée à `[min, max]`.
    pub fn float(flags: u16, class: PropertyClass, value: f64, min: f64, max: f64) -> Self {
        Self::new(
            flags,
            class,
            PropertyValue::Float {
                value: value.clamp(min, max),
                min,
                max,
            },
        )
    }

    pub fn boolean(flags: u16, class: PropertyClass, value: bool) -> Self {
        Self::new(flags, class, PropertyValue::Bool(value))
    }

    pub fn enumeration(
        flags: u16,
        class: PropertyClass,
        index: usize,
        choices: Vec<String>,
    ) -> Self {
        let index = index.min(choices.len().saturating_sub(1));
        Self::new(flags, class, PropertyValue::Enum { index, choices })
    }

    pub fn date(flags: u16, class: PropertyClass) -> Self {
        Self::new(flags, class, PropertyValue::Date(None))
    }

    pub fn stream(flags: u16, class: PropertyClass) -> Self {
        Self::new(flags, class, PropertyValue::Stream(Vec::new()))
    }

    pub fn with_label(mut self, label: &str) -> Self {
        let mut label = label.to_string();
        label.truncate(PROPERTY_MAX_LABEL);
        self.label = Some(label);
        self
    }

    pub fn with_affixes(mut self, prefix: &str, suffix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self.suffix = Some(suffix.to_string());
        self
    }

    pub fn property_type(&self) -> PropertyType {
        match self.value {
            PropertyValue::Text { .. } => PropertyType::Text,
            PropertyValue::Int { .. } | PropertyValue::Float { .. } => PropertyType::Number,
            PropertyValue::Bool(_) => PropertyType::Bool,
            PropertyValue::Enum { .. } => PropertyType::Enum,
            PropertyValue::Date(_) => PropertyType::Date,
            PropertyValue::Stream(_) => PropertyType::Stream,
        }
    }

    pub fn class(&self) -> PropertyClass {
        self.class
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn insert_flag(&mut self, flag: u16) {
        self.flags |= flag;
    }

    pub fn remove_flag(&mut self, flag: u16) {
        self.flags &= !flag;
    }

    pub fn is_read_only(&self) -> bool {
        self.has_flag(FLAG_READ_ONLY)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub(crate) fn set_timestamp(&mut self, when: DateTime<Utc>) {
        self.timestamp = Some(when);
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("")
    }

    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or("")
    }

    pub fn suffix(&self) -> &str {
        self.suffix.as_deref().unwrap_or("")
    }

    /// Change l'étiquette ; sans effet quand LOCK_LABEL est posé.
    /// `lock` fige l'étiquette pour la suite.
    pub fn set_label(&mut self, label: &str, lock: bool) {
        if self.has_flag(FLAG_LOCK_LABEL) {
            return;
        }

        if label.is_empty() {
            self.label = None;
        } else {
            let mut label = label.to_string();
            label.truncate(PROPERTY_MAX_LABEL);
            self.label = Some(label);
        }

        if lock {
            self.insert_flag(FLAG_LOCK_LABEL);
        }
    }

    /// Rend la valeur sous forme de chaîne, selon le type et la classe.
    pub fn render(&self) -> String {
        match &self.value {
            PropertyValue::Text { value, .. } => value.clone(),
            PropertyValue::Int { value, .. } => value.to_string(),
            PropertyValue::Float { value, .. } => format!("{:.2}", value),
            PropertyValue::Bool(value) => self.render_bool(*value).to_string(),
            PropertyValue::Enum { index, choices } => {
                choices.get(*index).cloned().unwrap_or_default()
            }
            PropertyValue::Date(value) => value.map(|d| d.to_rfc3339()).unwrap_or_default(),
            PropertyValue::Stream(bytes) => STANDARD.encode(bytes),
        }
    }

    fn render_bool(&self, value: bool) -> &'static str {
        match self.class {
            PropertyClass::Logic => {
                if value {
                    "High"
                } else {
                    "Low"
                }
            }
            PropertyClass::Switch | PropertyClass::Outlet | PropertyClass::Light => {
                if value {
                    "On"
                } else {
                    "Off"
                }
            }
            PropertyClass::Relay => {
                if value {
                    "Closed"
                } else {
                    "Open"
                }
            }
            PropertyClass::Valve => {
                if value {
                    "Open"
                } else {
                    "Closed"
                }
            }
            PropertyClass::Motion | PropertyClass::Boolean => {
                if value {
                    "true"
                } else {
                    "false"
                }
            }
            _ => {
                if value {
                    "1"
                } else {
                    "0"
                }
            }
        }
    }

    fn parse_bool(&self, raw: &str) -> bool {
        let trimmed = raw.trim();

        // Accepte le vocabulaire de rendu de la classe, puis le numérique
        let truthy = match self.class {
            PropertyClass::Relay => "closed",
            PropertyClass::Valve => "open",
            PropertyClass::Logic => "high",
            _ => "on",
        };
        if trimmed.eq_ignore_ascii_case(truthy) || trimmed.eq_ignore_ascii_case("true") {
            return true;
        }
        let falsy = match self.class {
            PropertyClass::Relay => "open",
            PropertyClass::Valve => "closed",
            PropertyClass::Logic => "low",
            _ => "off",
        };
        if trimmed.eq_ignore_ascii_case(falsy) || trimmed.eq_ignore_ascii_case("false") {
            return false;
        }

        trimmed.parse::<i64>().map(|n| n & 1 == 1).unwrap_or(false)
    }

    /// Applique une valeur brute : bornage numérique, troncature chaîne.
    /// Retourne vrai quand la valeur stockée a changé. Ne regarde pas les
    /// drapeaux : le point d'entrée unique est dans la Function.
    pub(crate) fn apply(&mut self, raw: &str) -> bool {
        let parsed_bool = if matches!(self.value, PropertyValue::Bool(_)) {
            Some(self.parse_bool(raw))
        } else {
            None
        };

        match &mut self.value {
            PropertyValue::Text { value, capacity } => {
                let mut new_val = raw.to_string();
                new_val.truncate(*capacity);
                if *value != new_val {
                    *value = new_val;
                    return true;
                }
                false
            }
            PropertyValue::Int { value, min, max } => {
                let new_val = raw.trim().parse::<i64>().unwrap_or(0).clamp(*min, *max);
                if *value != new_val {
                    *value = new_val;
                    return true;
                }
                false
            }
            PropertyValue::Float { value, min, max } => {
                let new_val = raw.trim().parse::<f64>().unwrap_or(0.0).clamp(*min, *max);
                if *value != new_val {
                    *value = new_val;
                    return true;
                }
                false
            }
            PropertyValue::Bool(value) => {
                let new_val = parsed_bool.unwrap_or(false);
                if *value != new_val {
                    *value = new_val;
                    return true;
                }
                false
            }
            PropertyValue::Enum { index, choices } => {
                let new_index = choices
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(raw.trim()))
                    .or_else(|| raw.trim().parse::<usize>().ok())
                    .filter(|i| *i < choices.len());
                match new_index {
                    Some(i) if i != *index => {
                        *index = i;
                        true
                    }
                    _ => false,
                }
            }
            PropertyValue::Date(value) => {
                let new_val = DateTime::parse_from_rfc3339(raw.trim())
                    .ok()
                    .map(|d| d.with_timezone(&Utc));
                if new_val.is_some() && *value != new_val {
                    *value = new_val;
                    return true;
                }
                false
            }
            PropertyValue::Stream(bytes) => {
                let new_val = STANDARD.decode(raw.trim()).unwrap_or_default();
                if *bytes != new_val {
                    *bytes = new_val;
                    return true;
                }
                false
            }
        }
    }

    /// Charge une valeur persistée, en ignorant READ_ONLY.
    pub(crate) fn load(&mut self, raw: &str) {
        let _ = self.apply(raw);
    }
}
