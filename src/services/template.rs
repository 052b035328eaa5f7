//! Rule-based story assembly. Always succeeds, needs no network.

use rand::seq::IndexedRandom;
use rand::Rng;

use crate::utils::text::capitalize_first;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gender {
    Masculine,
    Feminine,
}

/// A Spanish noun phrase that knows which articles agree with it.
#[derive(Debug, Clone, Copy)]
struct Noun {
    word: &'static str,
    gender: Gender,
}

const fn m(word: &'static str) -> Noun {
    Noun {
        word,
        gender: Gender::Masculine,
    }
}

const fn f(word: &'static str) -> Noun {
    Noun {
        word,
        gender: Gender::Feminine,
    }
}

impl Noun {
    fn indefinite(&self) -> String {
        match self.gender {
            Gender::Masculine => format!("un {}", self.word),
            Gender::Feminine => format!("una {}", self.word),
        }
    }

    fn definite(&self) -> String {
        match self.gender {
            Gender::Masculine => format!("el {}", self.word),
            Gender::Feminine => format!("la {}", self.word),
        }
    }

    /// `de` contracted with the definite article.
    fn of(&self) -> String {
        match self.gender {
            Gender::Masculine => format!("del {}", self.word),
            Gender::Feminine => format!("de la {}", self.word),
        }
    }

    fn agree(&self, masculine: &'static str, feminine: &'static str) -> &'static str {
        match self.gender {
            Gender::Masculine => masculine,
            Gender::Feminine => feminine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Aventura,
    Misterio,
    Magia,
    Amistad,
    Valentia,
}

const TOPIC_KEYWORDS: &[(Topic, &[&str])] = &[
    (Topic::Aventura, &["aventura", "aventurero", "explorar"]),
    (Topic::Misterio, &["misterio", "misterioso", "secreto"]),
    (Topic::Magia, &["magia", "mágico", "encantado"]),
    (Topic::Amistad, &["amistad", "amigo", "compañero"]),
    (Topic::Valentia, &["valentía", "valiente", "coraje"]),
];

impl Topic {
    /// First topic whose keywords appear in the prompt, `Aventura` otherwise.
    pub fn detect(prompt: &str) -> Self {
        let lower = prompt.to_lowercase();
        TOPIC_KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
            .map(|(topic, _)| *topic)
            .unwrap_or(Topic::Aventura)
    }

    fn noun(self) -> Noun {
        match self {
            Self::Aventura => f("aventura"),
            Self::Misterio => m("misterio"),
            Self::Magia => f("magia"),
            Self::Amistad => f("amistad"),
            Self::Valentia => f("valentía"),
        }
    }
}

const OPENINGS: &[&str] = &[
    "Érase una vez",
    "Hace mucho tiempo",
    "Según cuenta la leyenda",
    "En tiempos remotos",
    "Hace muchos años",
];

const TURNS: &[&str] = &[
    "Sin embargo, una mañana",
    "Pero un día",
    "Poco después",
    "Entonces, sin previo aviso",
    "No obstante, una noche",
];

const CLOSINGS: &[&str] = &[
    "Finalmente",
    "Desde ese día",
    "Con el tiempo",
    "Al cabo de los años",
    "Y así",
];

const CHARACTERS: &[Noun] = &[
    m("héroe"),
    f("exploradora"),
    m("sabio"),
    m("joven aventurero"),
    f("investigadora curiosa"),
    m("guerrero valiente"),
    f("inventora astuta"),
    f("sabia anciana"),
    m("niño curioso"),
    f("artista soñadora"),
    m("científico intrépido"),
    m("aprendiz de mago"),
    f("viajera incansable"),
];

const PLACES: &[Noun] = &[
    m("bosque encantado"),
    f("montaña misteriosa"),
    f("ciudad perdida"),
    f("isla secreta"),
    m("valle oculto"),
    m("castillo abandonado"),
    f("cueva profunda"),
    m("templo antiguo"),
    m("jardín mágico"),
    m("desierto infinito"),
    m("océano desconocido"),
    f("torre solitaria"),
    m("puente entre mundos"),
];

const OBJECTS: &[Noun] = &[
    f("llave antigua"),
    m("mapa misterioso"),
    m("cristal brillante"),
    m("libro encantado"),
    m("amuleto mágico"),
    m("espejo de plata"),
    f("piedra luminosa"),
    f("flauta encantada"),
    m("diario secreto"),
    f("brújula dorada"),
    f("espada legendaria"),
    f("corona perdida"),
    m("pergamino antiguo"),
];

const MAX_KEYWORDS: usize = 5;
const MORAL_PROBABILITY: f64 = 0.7;
const SPLICE_PROBABILITY: f64 = 0.3;

/// Distinct lowercase prompt words longer than three characters, in order of
/// first appearance.
pub fn prompt_keywords(prompt: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for raw in prompt.split_whitespace() {
        let word = raw
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if word.chars().count() > 3 && !keywords.contains(&word) {
            keywords.push(word);
            if keywords.len() == MAX_KEYWORDS {
                break;
            }
        }
    }
    keywords
}

fn pick<'a, T, R: Rng + ?Sized>(rng: &mut R, items: &'a [T]) -> &'a T {
    &items[rng.random_range(0..items.len())]
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateBackend;

impl TemplateBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self, prompt: &str) -> String {
        self.generate_with(prompt, &mut rand::rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(&self, prompt: &str, rng: &mut R) -> String {
        let topic = Topic::detect(prompt).noun();
        let keywords = prompt_keywords(prompt);

        let hero = *pick(rng, CHARACTERS);
        let place = *pick(rng, PLACES);
        let object = *pick(rng, OBJECTS);
        let opening = *pick(rng, OPENINGS);
        let turn = *pick(rng, TURNS);
        let closing = *pick(rng, CLOSINGS);
        let context_word = keywords.choose(rng);

        let introduction = match (rng.random_range(0..3), context_word) {
            (0, Some(word)) => format!(
                "{}, {} descubrió algo relacionado con {} en {}.",
                opening,
                hero.indefinite(),
                word,
                place.indefinite()
            ),
            (0, None) => format!(
                "{}, {} descubrió {} que nadie conocía.",
                opening,
                hero.indefinite(),
                place.indefinite()
            ),
            (1, _) => format!(
                "{}, en {}, vivía {}.",
                opening,
                place.indefinite(),
                hero.indefinite()
            ),
            _ => format!(
                "{}, {} llegó por casualidad a {}.",
                opening,
                hero.indefinite(),
                place.indefinite()
            ),
        };

        let development = match rng.random_range(0..3) {
            0 => format!(
                "{}, {} encontró {} que lo cambiaría todo. \
                 Aquel hallazgo fue el comienzo de {} que iría más allá de lo imaginado. \
                 En el camino enfrentó desafíos que pusieron a prueba su determinación.",
                turn,
                hero.definite(),
                object.indefinite(),
                topic.indefinite()
            ),
            1 => format!(
                "{}, {} descubrió que {} guardaba secretos increíbles. \
                 Con {} en sus manos, comenzó {} que nadie olvidaría.",
                turn,
                hero.definite(),
                place.definite(),
                object.definite(),
                topic.indefinite()
            ),
            _ => format!(
                "Pronto {} se dio cuenta de que {} no era lo que parecía. \
                 {}, apareció {} entre las sombras. \
                 Así comenzó {} que transformaría su vida para siempre.",
                hero.definite(),
                place.definite(),
                turn,
                object.indefinite(),
                topic.indefinite()
            ),
        };

        let resolution = match rng.random_range(0..3) {
            0 => format!(
                "{}, {} aprendió que {} {} está en encontrar soluciones nuevas a viejos problemas. \
                 {} fue solo el comienzo de una historia mucho mayor.",
                closing,
                hero.definite(),
                topic.definite(),
                topic.agree("verdadero", "verdadera"),
                capitalize_first(&object.definite())
            ),
            1 => format!(
                "{}, {} comprendió que {} le había enseñado a mirar el mundo con otros ojos. \
                 {} y {} fueron solo el inicio de algo extraordinario.",
                closing,
                hero.definite(),
                topic.definite(),
                capitalize_first(&place.definite()),
                object.definite()
            ),
            _ => format!(
                "Al final, {} descubrió que {} no trataba solo {}, sino del viaje mismo. \
                 {}, todo cambió para mejor.",
                hero.definite(),
                topic.definite(),
                object.of(),
                closing
            ),
        };

        let mut story = format!("{}\n\n{}\n\n{}", introduction, development, resolution);

        if rng.random_bool(MORAL_PROBABILITY) {
            let moral = match rng.random_range(0..4) {
                0 => format!(
                    "Y así, {} demostró que la creatividad puede transformar cualquier situación.",
                    hero.definite()
                ),
                1 => format!(
                    "Desde entonces, {} supo que cada desafío es una oportunidad para crear algo nuevo.",
                    hero.definite()
                ),
                2 => format!(
                    "{} aprendió que la verdadera magia está en mirar las cosas de otra manera.",
                    capitalize_first(&hero.definite())
                ),
                _ => format!(
                    "Y de esta forma, {} se convirtió en un ejemplo para todos los que sueñan.",
                    hero.definite()
                ),
            };
            story.push_str("\n\n");
            story.push_str(&moral);
        }

        if rng.random_bool(SPLICE_PROBABILITY) {
            if let Some(word) = keywords.choose(rng) {
                if !story.to_lowercase().contains(word.as_str()) {
                    story = story.replacen('.', &format!(", relacionado con {}.", word), 1);
                }
            }
        }

        story
    }
}
