//! Prompt engine: template registry, language detection, folder binding
//!
//! Templates are selected by (detected language, analysis mode) from a
//! version-tagged registry and expose exactly two substitution points: the
//! candidate-folder list (rendered as a JSON array so the model's parsing
//! is unambiguous) and the sanitized input block. The template version
//! contributes to the cache fingerprint, so editing a template invalidates
//! cached decisions for affected inputs.

use crate::privacy::SanitizedInput;
use crate::protocol::AnalysisMode;

/// Bumped whenever any template text changes.
pub const TEMPLATE_VERSION: &str = "v2";

/// How many body characters participate in language detection.
const DETECT_BODY_CHARS: usize = 200;

/// A prompt ready for a provider adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
    /// `<language>/<mode>@<version>`, for diagnostics.
    pub template_id: String,
    pub version: &'static str,
}

/// Field labels for one template language.
struct LangPack {
    code: &'static str,
    preamble: &'static str,
    subject: &'static str,
    sender: &'static str,
    attachments: &'static str,
    body: &'static str,
}

const EN: LangPack = LangPack {
    code: "en",
    preamble: "Classify the following email into one of these folders:",
    subject: "Subject",
    sender: "Sender",
    attachments: "Attachments",
    body: "Body",
};

const DE: LangPack = LangPack {
    code: "de",
    preamble: "Ordne die folgende E-Mail einem dieser Ordner zu:",
    subject: "Betreff",
    sender: "Absender",
    attachments: "Anhänge",
    body: "Inhalt",
};

const FR: LangPack = LangPack {
    code: "fr",
    preamble: "Classe le courriel suivant dans l'un de ces dossiers :",
    subject: "Objet",
    sender: "Expéditeur",
    attachments: "Pièces jointes",
    body: "Corps",
};

const ES: LangPack = LangPack {
    code: "es",
    preamble: "Clasifica el siguiente correo en una de estas carpetas:",
    subject: "Asunto",
    sender: "Remitente",
    attachments: "Adjuntos",
    body: "Cuerpo",
};

const SYSTEM_PROMPT: &str = "You are an email classification engine. \
Choose exactly one folder name from the provided list, verbatim. \
Respond with a single JSON object of the form \
{\"folder\": \"<name>\", \"confidence\": <number between 0.0 and 1.0>}. \
Never output prose, markdown, or anything outside that JSON object.";

/// Version-tagged template registry.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    default_language: String,
}

impl TemplateRegistry {
    #[must_use]
    pub fn new(default_language: impl Into<String>) -> Self {
        Self {
            default_language: default_language.into(),
        }
    }

    /// Best-effort ISO-639-1 language of (subject, first 200 body chars).
    ///
    /// Falls back to the configured default when detection is unreliable
    /// or the language has no template.
    #[must_use]
    pub fn detect_language(&self, subject: &str, body: &str) -> String {
        let snippet: String = body.chars().take(DETECT_BODY_CHARS).collect();
        let sample = format!("{subject} {snippet}");

        let detected = whatlang::detect(&sample)
            .filter(whatlang::Info::is_reliable)
            .and_then(|info| iso_639_1(info.lang()));

        detected.map_or_else(|| self.default_language.clone(), ToString::to_string)
    }

    /// Render the prompt for one sanitized input.
    ///
    /// Uses `input.detected_language` when set, detecting otherwise.
    #[must_use]
    pub fn render(
        &self,
        input: &SanitizedInput,
        folders: &[String],
        mode: AnalysisMode,
    ) -> RenderedPrompt {
        let language = input.detected_language.clone().unwrap_or_else(|| {
            self.detect_language(&input.subject, &input.body)
        });
        let pack = lang_pack(&language)
            .or_else(|| lang_pack(&self.default_language))
            .unwrap_or(&EN);

        let folder_list = serde_json::to_string(folders).unwrap_or_else(|_| "[]".to_string());

        let mut user = format!(
            "{preamble}\n{folders}\n\n{subject}: {s}\n{sender}: {f}\n",
            preamble = pack.preamble,
            folders = folder_list,
            subject = pack.subject,
            s = input.subject,
            sender = pack.sender,
            f = input.sender,
        );

        if !input.attachment_hints.is_empty() {
            user.push_str(&format!(
                "{}: {}\n",
                pack.attachments,
                input.attachment_hints.join(", ")
            ));
        }

        if mode == AnalysisMode::Full {
            user.push_str(&format!("{}:\n{}\n", pack.body, input.body));
        }

        let mode_tag = match mode {
            AnalysisMode::Full => "full",
            AnalysisMode::HeadersOnly => "headers_only",
        };

        RenderedPrompt {
            system: SYSTEM_PROMPT.to_string(),
            user,
            template_id: format!("{}/{}@{}", pack.code, mode_tag, TEMPLATE_VERSION),
            version: TEMPLATE_VERSION,
        }
    }
}

fn lang_pack(code: &str) -> Option<&'static LangPack> {
    match code {
        "en" => Some(&EN),
        "de" => Some(&DE),
        "fr" => Some(&FR),
        "es" => Some(&ES),
        _ => None,
    }
}

fn iso_639_1(lang: whatlang::Lang) -> Option<&'static str> {
    match lang {
        whatlang::Lang::Eng => Some("en"),
        whatlang::Lang::Deu => Some("de"),
        whatlang::Lang::Fra => Some("fr"),
        whatlang::Lang::Spa => Some("es"),
        whatlang::Lang::Ita => Some("it"),
        whatlang::Lang::Por => Some("pt"),
        whatlang::Lang::Nld => Some("nl"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(subject: &str, body: &str) -> SanitizedInput {
        SanitizedInput {
            subject: subject.to_string(),
            sender: "someone".to_string(),
            body: body.to_string(),
            attachment_hints: vec![],
            detected_language: None,
        }
    }

    #[test]
    fn detects_german() {
        let registry = TemplateRegistry::new("en");
        let language = registry.detect_language(
            "Ihre Rechnung für März",
            "Sehr geehrte Damen und Herren, anbei erhalten Sie die aktuelle \
             Rechnung für Ihren Vertrag. Bitte überweisen Sie den Betrag bis \
             zum Ende des Monats auf das angegebene Konto.",
        );
        assert_eq!(language, "de");
    }

    #[test]
    fn falls_back_on_short_text() {
        let registry = TemplateRegistry::new("en");
        assert_eq!(registry.detect_language("hi", ""), "en");
    }

    #[test]
    fn render_binds_folders_as_json_array() {
        let registry = TemplateRegistry::new("en");
        let folders = vec!["Invoices".to_string(), "Personal".to_string()];
        let prompt = registry.render(
            &input("Invoice #42", "please pay"),
            &folders,
            AnalysisMode::Full,
        );
        assert!(prompt.user.contains(r#"["Invoices","Personal"]"#));
        assert!(prompt.system.contains("exactly one folder"));
        assert_eq!(prompt.template_id, "en/full@v2");
    }

    #[test]
    fn headers_only_omits_body_block() {
        let registry = TemplateRegistry::new("en");
        let folders = vec!["Invoices".to_string()];
        let mut sanitized = input("Invoice #42", "");
        sanitized.detected_language = Some("en".to_string());

        let prompt = registry.render(&sanitized, &folders, AnalysisMode::HeadersOnly);
        assert!(!prompt.user.contains("Body:"));
        assert_eq!(prompt.template_id, "en/headers_only@v2");
    }

    #[test]
    fn unsupported_language_uses_default_pack() {
        let registry = TemplateRegistry::new("en");
        let mut sanitized = input("subject", "body");
        sanitized.detected_language = Some("nl".to_string());

        let prompt = registry.render(&sanitized, &["A".to_string()], AnalysisMode::Full);
        assert!(prompt.user.starts_with(EN.preamble));
    }
}
