//! Asset classification types.
//!
//! A library root is declared with a mode that decides which files it holds,
//! and model roots may carry a model type that drives registry field mapping
//! and the conventional ComfyUI folder.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What kind of assets a library root holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetMode {
    /// Binary model weights
    Model,
    /// ComfyUI workflow graphs
    Workflow,
    /// Plain-text prompt collections
    Prompt,
    /// Generated images and videos
    Gallery,
}

impl AssetMode {
    pub const ALL: [AssetMode; 4] = [
        AssetMode::Model,
        AssetMode::Workflow,
        AssetMode::Prompt,
        AssetMode::Gallery,
    ];

    /// Return the canonical lowercase string for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetMode::Model => "model",
            AssetMode::Workflow => "workflow",
            AssetMode::Prompt => "prompt",
            AssetMode::Gallery => "gallery",
        }
    }

    /// File extensions (lowercase, without the dot) belonging to this mode.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            AssetMode::Model => &["ckpt", "pt", "bin", "safetensors", "gguf"],
            AssetMode::Workflow => &["json"],
            AssetMode::Prompt => &["txt"],
            AssetMode::Gallery => &["png", "jpg", "jpeg", "webp", "gif", "mp4", "webm", "mov"],
        }
    }

    /// Whether `path` has an extension this mode accepts.
    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions().iter().any(|known| *known == ext)
            })
            .unwrap_or(false)
    }
}

impl std::fmt::Display for AssetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "model" | "models" => Ok(AssetMode::Model),
            "workflow" | "workflows" => Ok(AssetMode::Workflow),
            "prompt" | "prompts" => Ok(AssetMode::Prompt),
            "gallery" => Ok(AssetMode::Gallery),
            other => Err(format!("unknown asset mode '{}'", other)),
        }
    }
}

/// Model type tag for model-mode assets.
///
/// Each variant carries its own mapping to the registry's type name and to
/// the ComfyUI sub-folder it conventionally lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModelType {
    Checkpoint,
    Lora,
    LyCoris,
    Vae,
    ControlNet,
    TextualInversion,
    Upscaler,
    Hypernetwork,
    MotionModule,
    Other(String),
}

impl ModelType {
    /// Return the canonical lowercase string for this model type.
    pub fn as_str(&self) -> &str {
        match self {
            ModelType::Checkpoint => "checkpoint",
            ModelType::Lora => "lora",
            ModelType::LyCoris => "lycoris",
            ModelType::Vae => "vae",
            ModelType::ControlNet => "controlnet",
            ModelType::TextualInversion => "embedding",
            ModelType::Upscaler => "upscaler",
            ModelType::Hypernetwork => "hypernetwork",
            ModelType::MotionModule => "motion_module",
            ModelType::Other(s) => s,
        }
    }

    /// The type name used by the Civitai registry.
    pub fn registry_name(&self) -> &str {
        match self {
            ModelType::Checkpoint => "Checkpoint",
            ModelType::Lora => "LORA",
            ModelType::LyCoris => "LoCon",
            ModelType::Vae => "VAE",
            ModelType::ControlNet => "Controlnet",
            ModelType::TextualInversion => "TextualInversion",
            ModelType::Upscaler => "Upscaler",
            ModelType::Hypernetwork => "Hypernetwork",
            ModelType::MotionModule => "MotionModule",
            ModelType::Other(s) => s,
        }
    }

    /// The ComfyUI `models/` sub-folder for this type.
    pub fn comfy_folder(&self) -> &str {
        match self {
            ModelType::Checkpoint => "checkpoints",
            ModelType::Lora | ModelType::LyCoris => "loras",
            ModelType::Vae => "vae",
            ModelType::ControlNet => "controlnet",
            ModelType::TextualInversion => "embeddings",
            ModelType::Upscaler => "upscale_models",
            ModelType::Hypernetwork => "hypernetworks",
            ModelType::MotionModule => "animatediff_models",
            ModelType::Other(s) => s,
        }
    }

    /// Map a registry type name back to a model type.
    pub fn from_registry_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "checkpoint" => ModelType::Checkpoint,
            "lora" | "dora" => ModelType::Lora,
            "locon" | "lycoris" => ModelType::LyCoris,
            "vae" => ModelType::Vae,
            "controlnet" => ModelType::ControlNet,
            "textualinversion" => ModelType::TextualInversion,
            "upscaler" => ModelType::Upscaler,
            "hypernetwork" => ModelType::Hypernetwork,
            "motionmodule" => ModelType::MotionModule,
            _ => ModelType::Other(name.to_string()),
        }
    }
}

impl From<String> for ModelType {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "checkpoint" | "checkpoints" => ModelType::Checkpoint,
            "lora" | "loras" => ModelType::Lora,
            "lycoris" | "locon" => ModelType::LyCoris,
            "vae" => ModelType::Vae,
            "controlnet" => ModelType::ControlNet,
            "embedding" | "embeddings" | "textualinversion" => ModelType::TextualInversion,
            "upscaler" | "upscale_models" => ModelType::Upscaler,
            "hypernetwork" | "hypernetworks" => ModelType::Hypernetwork,
            "motion_module" | "motionmodule" => ModelType::MotionModule,
            _ => ModelType::Other(s),
        }
    }
}

impl From<ModelType> for String {
    fn from(t: ModelType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file found by a scan pass.
///
/// Re-derived on every scan; never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetPath {
    path: PathBuf,
    mode: AssetMode,
    model_type: Option<ModelType>,
}

impl AssetPath {
    pub fn new(path: PathBuf, mode: AssetMode, model_type: Option<ModelType>) -> Self {
        Self {
            path,
            mode,
            model_type,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> AssetMode {
        self.mode
    }

    pub fn model_type(&self) -> Option<&ModelType> {
        self.model_type.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_accepts_case_insensitive() {
        assert!(AssetMode::Model.accepts(Path::new("/m/foo.SafeTensors")));
        assert!(AssetMode::Gallery.accepts(Path::new("a.JPG")));
        assert!(!AssetMode::Model.accepts(Path::new("foo.safetensors.part")));
        assert!(!AssetMode::Prompt.accepts(Path::new("noext")));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Workflow".parse::<AssetMode>(), Ok(AssetMode::Workflow));
        assert!("video".parse::<AssetMode>().is_err());
    }

    #[test]
    fn test_model_type_registry_mapping() {
        assert_eq!(ModelType::Lora.registry_name(), "LORA");
        assert_eq!(ModelType::from_registry_name("LORA"), ModelType::Lora);
        assert_eq!(ModelType::from_registry_name("LoCon"), ModelType::LyCoris);
        assert_eq!(
            ModelType::from_registry_name("Wildcards"),
            ModelType::Other("Wildcards".into())
        );
        assert_eq!(ModelType::LyCoris.comfy_folder(), "loras");
    }

    #[test]
    fn test_model_type_serde_as_string() {
        let json = serde_json::to_string(&ModelType::TextualInversion).unwrap();
        assert_eq!(json, "\"embedding\"");
        let back: ModelType = serde_json::from_str("\"checkpoints\"").unwrap();
        assert_eq!(back, ModelType::Checkpoint);
        let other: ModelType = serde_json::from_str("\"clip_vision\"").unwrap();
        assert_eq!(other, ModelType::Other("clip_vision".into()));
    }
}
