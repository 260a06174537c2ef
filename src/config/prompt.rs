use serde::{ Deserialize, Serialize };
use std::fs;
use std::sync::Arc;
use log::info;

use crate::error::ConfigError;
use crate::models::chat::{ ChatMessage, Conversation };
use crate::models::websocket::Header;

/// Number of prior messages carried into a windowed prompt.
pub const HISTORY_WINDOW: usize = 4;

const DEFAULT_SYSTEM_PROMPT: &str = r#"Eres VictorIA, una asistente hombre salvadoreño virtual especializada en **minería de datos y análisis estadístico**, creada por estudiantes de la **Universidad Andrés Bello (UNAB), El Salvador**.

**Equipo creador:**
- **Estudiantes:** Héctor, Germán, Miguel, Víctor, Melissa y Melvin.
- **Ingeniero supervisor:** José Guillermo Rivera Pleitez (Contacto: joseguillermo.rivera@unab.edu.sv)

Tus capacidades incluyen:
1. Modelos de Machine Learning:
   - Regresión y clasificación con scikit-learn
   - Modelos avanzados con XGBoost
   - Clustering y segmentación
   - AutoML para optimización automática

2. Visualización de datos:
   - Gráficos interactivos con Plotly
   - Visualizaciones declarativas con Altair
   - Dashboards con Streamlit

3. Análisis exploratorio:
   - Generación automática de informes con pandas-profiling
   - Detección de outliers y patrones
   - Análisis de correlaciones

4. Validación y seguridad:
   - Verificación de intención del usuario
   - Protección contra código malicioso
   - Cumplimiento de normativas GDPR
"#;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Capability {
    pub icon: String,
    pub title: String,
    pub features: Vec<String>,
    pub color: String,
}

impl Capability {
    fn new(icon: &str, title: &str, features: &[&str], color: &str) -> Self {
        Self {
            icon: icon.to_string(),
            title: title.to_string(),
            features: features.iter().map(|f| f.to_string()).collect(),
            color: color.to_string(),
        }
    }
}

/// Persona text plus the one-time header and capability gallery shown to a new session.
#[derive(Deserialize, Debug, Clone)]
pub struct PersonaConfig {
    pub system_prompt: String,
    pub header: Header,
    pub capabilities: Vec<Capability>,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            header: Header {
                title: "VictorIA 🤖".to_string(),
                subtitle: "Tu asistente inteligente para análisis de datos y programación".to_string(),
            },
            capabilities: vec![
                Capability::new(
                    "🧠",
                    "Machine Learning",
                    &[
                        "Modelos de clasificación y regresión",
                        "Clustering y segmentación",
                        "Optimización automática de modelos",
                    ],
                    "#4f46e5"
                ),
                Capability::new(
                    "📈",
                    "Visualización",
                    &[
                        "Gráficos interactivos con Plotly",
                        "Dashboards dinámicos",
                        "Análisis visual de patrones",
                    ],
                    "#7c3aed"
                ),
                Capability::new(
                    "🔍",
                    "Análisis Exploratorio",
                    &[
                        "Informes automáticos de datos",
                        "Detección de outliers",
                        "Análisis de correlaciones",
                    ],
                    "#2563eb"
                ),
                Capability::new(
                    "💡",
                    "Mejores Prácticas",
                    &[
                        "Código limpio y documentado",
                        "Validación de datos",
                        "Seguridad y ética en el análisis",
                    ],
                    "#9333ea"
                ),
            ],
        }
    }
}

pub fn load_persona(path: Option<&str>) -> Result<Arc<PersonaConfig>, ConfigError> {
    let Some(path) = path else {
        return Ok(Arc::new(PersonaConfig::default()));
    };
    let file_content = fs::read_to_string(path).map_err(|source| ConfigError::PersonaRead {
        path: path.to_string(),
        source,
    })?;
    let config: PersonaConfig = serde_json
        ::from_str(&file_content)
        .map_err(|source| ConfigError::PersonaParse {
            path: path.to_string(),
            source,
        })?;
    info!("Loaded persona '{}' from {}", config.header.title, path);
    Ok(Arc::new(config))
}

/// `[system] + last HISTORY_WINDOW of history + [user]`.
pub fn compose(system_prompt: &str, history: &Conversation, user_input: &str) -> Vec<ChatMessage> {
    let window = history.tail(HISTORY_WINDOW);
    let mut messages = Vec::with_capacity(window.len() + 2);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend(window.iter().cloned());
    messages.push(ChatMessage::user(user_input));
    messages
}

/// What the live endpoint receives by default: persona and current prompt only.
pub fn live_messages(system_prompt: &str, user_input: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::system(system_prompt), ChatMessage::user(user_input)]
}
