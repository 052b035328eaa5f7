use std::fmt;

pub use crate::core::config::AcceptanceRules;
use crate::utils::text::{char_len, lowercase_tokens, sentence_segments};

/// Substrings that suggest the text is told as a story.
const NARRATIVE_MARKERS: &[&str] = &[
    "érase",
    "había",
    "era",
    "cuenta",
    "hace",
    "una vez",
    "entonces",
    "después",
    "finalmente",
    "así",
    "desde",
    "personaje",
    "protagonista",
    "aventura",
    "historia",
    "once upon",
    "then",
    "finally",
    "suddenly",
    "story",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    TooShort { chars: usize, min: usize },
    TooFewSentences { count: usize, min: usize },
    NoNarrativeMarkers { sentences: usize },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { chars, min } => {
                write!(f, "too short ({} chars, need {})", chars, min)
            }
            Self::TooFewSentences { count, min } => {
                write!(f, "too few sentences ({}, need {})", count, min)
            }
            Self::NoNarrativeMarkers { sentences } => {
                write!(f, "no narrative markers in {} sentences", sentences)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub acceptable: bool,
    pub rejection: Option<Rejection>,
}

impl Verdict {
    fn accept() -> Self {
        Self {
            acceptable: true,
            rejection: None,
        }
    }

    fn reject(rejection: Rejection) -> Self {
        Self {
            acceptable: false,
            rejection: Some(rejection),
        }
    }
}

pub fn has_narrative_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    NARRATIVE_MARKERS.iter().any(|m| lower.contains(m))
}

impl AcceptanceRules {
    pub fn check(&self, text: &str) -> Verdict {
        let chars = char_len(text);
        if chars < self.min_chars {
            return Verdict::reject(Rejection::TooShort {
                chars,
                min: self.min_chars,
            });
        }

        let sentences = sentence_segments(text).len();
        if sentences < self.min_sentences {
            return Verdict::reject(Rejection::TooFewSentences {
                count: sentences,
                min: self.min_sentences,
            });
        }

        if has_narrative_marker(text) || sentences >= self.rich_sentences {
            Verdict::accept()
        } else {
            Verdict::reject(Rejection::NoNarrativeMarkers { sentences })
        }
    }

    pub fn is_acceptable(&self, text: &str) -> bool {
        self.check(text).acceptable
    }

    /// True when the story shares enough words with the prompt, or is long
    /// enough to be trusted anyway.
    pub fn is_relevant(&self, prompt: &str, text: &str) -> bool {
        if char_len(text) > self.relevance_long_chars {
            return true;
        }
        let prompt_tokens = lowercase_tokens(prompt);
        let text_tokens = lowercase_tokens(text);
        prompt_tokens.intersection(&text_tokens).count() >= self.relevance_min_shared
    }

    /// Gate applied to local model output before it is returned to a user.
    pub fn accepts_local(&self, prompt: &str, text: &str) -> Result<(), String> {
        let chars = char_len(text);
        if chars <= self.local_min_chars {
            return Err(format!(
                "output too short ({} chars, need more than {})",
                chars, self.local_min_chars
            ));
        }
        if let Some(rejection) = self.check(text).rejection {
            return Err(rejection.to_string());
        }
        if !self.is_relevant(prompt, text) {
            return Err("output unrelated to the prompt".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORY: &str = "Érase una vez un robot pequeño. Vivía en un taller. \
        Un día descubrió un libro antiguo. Entonces aprendió a soñar.";

    #[test]
    fn test_accepts_story() {
        let rules = AcceptanceRules::default();
        assert_eq!(rules.check(STORY), Verdict::accept());
    }

    #[test]
    fn test_rejects_short_text() {
        let rules = AcceptanceRules::default();
        let verdict = rules.check("Hola. Adiós. Fin.");
        assert!(!verdict.acceptable);
        assert!(matches!(verdict.rejection, Some(Rejection::TooShort { min: 50, .. })));
    }

    #[test]
    fn test_rejects_few_sentences() {
        let rules = AcceptanceRules::default();
        let text = "Había una vez un robot que caminaba por el bosque sin rumbo fijo y sin prisa alguna";
        assert_eq!(
            rules.check(text).rejection,
            Some(Rejection::TooFewSentences { count: 1, min: 3 })
        );
    }

    #[test]
    fn test_markers_or_rich_sentences() {
        let rules = AcceptanceRules::default();
        let plain = "El gato come pescado fresco. El perro ladra fuerte. La luna brilla mucho.";
        assert_eq!(
            rules.check(plain).rejection,
            Some(Rejection::NoNarrativeMarkers { sentences: 3 })
        );

        let rich = "El gato come pescado. El perro ladra. La luna brilla. El río corre. El sol sale.";
        assert!(rules.is_acceptable(rich));

        let marked = "El gato come pescado fresco. Entonces el perro ladra. La luna brilla mucho.";
        assert!(rules.is_acceptable(marked));
    }

    #[test]
    fn test_marker_matching_is_case_insensitive() {
        assert!(has_narrative_marker("ONCE UPON a time"));
        assert!(!has_narrative_marker("nada que ver aquí"));
    }

    #[test]
    fn test_relevance() {
        let rules = AcceptanceRules::default();
        assert!(rules.is_relevant("un robot que sueña", "Un robot pequeño que vivía solo."));
        assert!(!rules.is_relevant("dragones de fuego", "El gato duerme en la casa."));
        let long = "palabra ".repeat(40);
        assert!(rules.is_relevant("dragones de fuego", &long));
    }

    #[test]
    fn test_local_gate() {
        let rules = AcceptanceRules::default();
        assert!(rules.accepts_local("robot", "Corto.").is_err());

        let unrelated = "El gato duerme en la casa grande. Entonces llega la noche fría. \
            Después sale la luna sobre el tejado.";
        assert!(rules.accepts_local("dragones de fuego", unrelated).is_err());

        let related = "Érase una vez un robot que aprende a soñar. Vivía solo en un taller. \
            Entonces un robot viejo le enseñó a mirar las estrellas.";
        assert_eq!(rules.accepts_local("un robot que aprende a soñar", related), Ok(()));
    }
}
