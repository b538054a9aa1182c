//! ComfyUI graph summaries.
//!
//! ComfyUI embeds the API prompt (`{"<id>": {"class_type", "inputs"}}`) in a
//! `prompt` chunk and the editor graph (`{"nodes": [...], "links": [...]}`)
//! in a `workflow` chunk. Either form is reduced to the shared vocabulary:
//! sampler settings, prompts traced through the sampler's conditioning
//! inputs, checkpoint and LoRAs.

use super::fields::{ParsedFields, NEGATIVE_PROMPT, PROMPT};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const SAMPLERS: &[&str] = &["KSampler", "KSamplerAdvanced", "KSampler (Efficient)"];
const TEXT_ENCODERS: &[&str] = &["CLIPTextEncode", "CLIPTextEncodeSDXL", "ShowText", "Text"];
const CHECKPOINT_LOADERS: &[&str] = &["CheckpointLoaderSimple", "CheckpointLoader"];
const LORA_LOADERS: &[&str] = &["LoraLoader", "LoraLoaderModelOnly"];

/// Widget order of the node types the summary reads, for editor graphs.
const WIDGETS: &[(&str, &[&str])] = &[
    ("KSampler", &["seed", "control_after_generate", "steps", "cfg", "sampler_name", "scheduler", "denoise"]),
    ("KSamplerAdvanced", &["add_noise", "noise_seed", "control_after_generate", "steps", "cfg", "sampler_name", "scheduler"]),
    ("CLIPTextEncode", &["text"]),
    ("CLIPTextEncodeSDXL", &["width", "height", "crop_w", "crop_h", "target_width", "target_height", "text_g", "text_l"]),
    ("CheckpointLoaderSimple", &["ckpt_name"]),
    ("CheckpointLoader", &["config_name", "ckpt_name"]),
    ("LoraLoader", &["lora_name", "strength_model", "strength_clip"]),
    ("LoraLoaderModelOnly", &["lora_name", "strength_model"]),
];

/// An input value: a literal, or a link to another node's output.
#[derive(Debug, Clone)]
enum Input {
    Literal(Value),
    Link(String),
}

#[derive(Debug, Clone)]
struct Node {
    class_type: String,
    inputs: BTreeMap<String, Input>,
}

impl Node {
    fn literal(&self, name: &str) -> Option<&Value> {
        match self.inputs.get(name)? {
            Input::Literal(v) => Some(v),
            Input::Link(_) => None,
        }
    }

    fn link(&self, name: &str) -> Option<&str> {
        match self.inputs.get(name)? {
            Input::Link(id) => Some(id),
            Input::Literal(_) => None,
        }
    }

    fn text(&self) -> Option<String> {
        ["text", "text_g", "text_l"]
            .iter()
            .find_map(|k| self.literal(k).and_then(Value::as_str))
            .map(str::to_string)
    }
}

/// Whether `value` parses as a ComfyUI graph in either form.
pub fn is_graph(value: &Value) -> bool {
    !nodes(value).is_empty()
}

/// Summarize a graph into vocabulary fields.
pub fn summarize(graph: &Value) -> ParsedFields {
    let nodes = nodes(graph);
    let mut fields = ParsedFields::new();

    let sampler = nodes
        .values()
        .find(|n| SAMPLERS.contains(&n.class_type.as_str()));

    let mut positive = None;
    let mut negative = None;
    if let Some(sampler) = sampler {
        positive = sampler.link("positive").and_then(|id| trace_text(&nodes, id, 0));
        negative = sampler.link("negative").and_then(|id| trace_text(&nodes, id, 0));
    }
    if positive.is_none() && negative.is_none() {
        let texts: Vec<String> = nodes
            .values()
            .filter(|n| TEXT_ENCODERS[..2].contains(&n.class_type.as_str()))
            .filter_map(Node::text)
            .filter(|t| !t.trim().is_empty())
            .collect();
        if !texts.is_empty() {
            positive = Some(texts.join("\n---\n"));
        }
    }
    if let Some(text) = positive {
        fields.insert(PROMPT, text);
    }
    if let Some(text) = negative {
        fields.insert(NEGATIVE_PROMPT, text);
    }

    if let Some(sampler) = sampler {
        let seed = sampler
            .literal("seed")
            .or_else(|| sampler.literal("noise_seed"));
        let pairs = [
            ("Steps", sampler.literal("steps")),
            ("Sampler", sampler.literal("sampler_name")),
            ("Schedule type", sampler.literal("scheduler")),
            ("CFG scale", sampler.literal("cfg")),
            ("Seed", seed),
        ];
        for (key, value) in pairs {
            if let Some(value) = value.and_then(scalar) {
                fields.insert(key, value);
            }
        }
    }

    if let Some(model) = nodes
        .values()
        .find(|n| CHECKPOINT_LOADERS.contains(&n.class_type.as_str()))
        .and_then(|n| n.literal("ckpt_name"))
        .and_then(scalar)
    {
        fields.insert("Model", model);
    }

    let loras: Vec<String> = nodes
        .values()
        .filter(|n| LORA_LOADERS.contains(&n.class_type.as_str()))
        .filter_map(|n| {
            let name = n.literal("lora_name").and_then(scalar)?;
            Some(match n.literal("strength_model").and_then(scalar) {
                Some(strength) => format!("{} ({})", name, strength),
                None => name,
            })
        })
        .collect();
    if !loras.is_empty() {
        fields.insert("Loras", loras.join(", "));
    }

    fields
}

/// Follow conditioning links back to the text encoder that produced them.
fn trace_text(nodes: &BTreeMap<String, Node>, id: &str, depth: usize) -> Option<String> {
    if depth > 16 {
        return None;
    }
    let node = nodes.get(id)?;
    if TEXT_ENCODERS.contains(&node.class_type.as_str()) {
        if let Some(text) = node.text() {
            return Some(text);
        }
    }
    // Pass-through nodes (conditioning combine, ControlNet apply, ...).
    ["conditioning", "conditioning_1", "positive", "text"]
        .iter()
        .filter_map(|name| node.link(name))
        .find_map(|upstream| trace_text(nodes, upstream, depth + 1))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Normalize either graph form into id-keyed nodes.
fn nodes(graph: &Value) -> BTreeMap<String, Node> {
    match graph {
        Value::Object(map) if map.get("nodes").map_or(false, Value::is_array) => {
            editor_nodes(map)
        }
        Value::Object(map) => api_nodes(map.iter()),
        Value::Array(items) => api_nodes(items.iter().filter_map(|item| {
            let id = item.get("id")?;
            Some((id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string()), item))
        })),
        _ => BTreeMap::new(),
    }
}

fn api_nodes<'a, K, I>(items: I) -> BTreeMap<String, Node>
where
    K: AsRef<str>,
    I: Iterator<Item = (K, &'a Value)>,
{
    let mut nodes = BTreeMap::new();
    for (id, node) in items {
        let Some(class_type) = node.get("class_type").and_then(Value::as_str) else {
            continue;
        };
        let inputs = node
            .get("inputs")
            .and_then(Value::as_object)
            .map(|inputs| {
                inputs
                    .iter()
                    .map(|(name, value)| (name.clone(), api_input(value)))
                    .collect()
            })
            .unwrap_or_default();
        nodes.insert(
            id.as_ref().to_string(),
            Node {
                class_type: class_type.to_string(),
                inputs,
            },
        );
    }
    nodes
}

/// `[node_id, slot]` is a link in the API form.
fn api_input(value: &Value) -> Input {
    if let Some([id, slot]) = value.as_array().map(Vec::as_slice) {
        if slot.is_u64() {
            if let Some(id) = id.as_str() {
                return Input::Link(id.to_string());
            }
            if id.is_u64() {
                return Input::Link(id.to_string());
            }
        }
    }
    Input::Literal(value.clone())
}

fn editor_nodes(graph: &Map<String, Value>) -> BTreeMap<String, Node> {
    // link id -> source node id
    let mut link_sources = BTreeMap::new();
    for link in graph
        .get("links")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        // [link_id, from_node, from_slot, to_node, to_slot, type]
        if let (Some(link_id), Some(from)) = (
            link.get(0).and_then(Value::as_u64),
            link.get(1).and_then(Value::as_u64),
        ) {
            link_sources.insert(link_id, from.to_string());
        }
    }

    let mut nodes = BTreeMap::new();
    for node in graph
        .get("nodes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let (Some(id), Some(class_type)) = (
            node.get("id").and_then(Value::as_u64),
            node.get("type").and_then(Value::as_str),
        ) else {
            continue;
        };

        let mut inputs = BTreeMap::new();
        if let Some(names) = WIDGETS
            .iter()
            .find(|(kind, _)| *kind == class_type)
            .map(|(_, names)| *names)
        {
            let widgets = node
                .get("widgets_values")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for (name, value) in names.iter().zip(widgets) {
                inputs.insert(name.to_string(), Input::Literal(value.clone()));
            }
        }
        for input in node
            .get("inputs")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let (Some(name), Some(link)) = (
                input.get("name").and_then(Value::as_str),
                input.get("link").and_then(Value::as_u64),
            ) else {
                continue;
            };
            if let Some(source) = link_sources.get(&link) {
                inputs.insert(name.to_string(), Input::Link(source.clone()));
            }
        }

        nodes.insert(
            id.to_string(),
            Node {
                class_type: class_type.to_string(),
                inputs,
            },
        );
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api_prompt() -> Value {
        json!({
            "3": {"class_type": "KSampler", "inputs": {
                "seed": 156680208700286u64, "steps": 20, "cfg": 8.0,
                "sampler_name": "euler", "scheduler": "normal", "denoise": 1.0,
                "model": ["10", 0], "positive": ["6", 0], "negative": ["7", 0],
                "latent_image": ["5", 0]
            }},
            "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "v1-5-pruned.safetensors"}},
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "a fox in snow", "clip": ["10", 1]}},
            "7": {"class_type": "CLIPTextEncode", "inputs": {"text": "blurry", "clip": ["10", 1]}},
            "10": {"class_type": "LoraLoader", "inputs": {
                "lora_name": "fox.safetensors", "strength_model": 0.8, "strength_clip": 1.0,
                "model": ["4", 0], "clip": ["4", 1]
            }}
        })
    }

    #[test]
    fn test_summarize_api_prompt() {
        let fields = summarize(&api_prompt());
        assert_eq!(fields.get(PROMPT), Some("a fox in snow"));
        assert_eq!(fields.get(NEGATIVE_PROMPT), Some("blurry"));
        assert_eq!(fields.get("Steps"), Some("20"));
        assert_eq!(fields.get("Sampler"), Some("euler"));
        assert_eq!(fields.get("Schedule type"), Some("normal"));
        assert_eq!(fields.get("CFG scale"), Some("8.0"));
        assert_eq!(fields.get("Seed"), Some("156680208700286"));
        assert_eq!(fields.get("Model"), Some("v1-5-pruned.safetensors"));
        assert_eq!(fields.get("Loras"), Some("fox.safetensors (0.8)"));
    }

    #[test]
    fn test_summarize_editor_workflow() {
        let workflow = json!({
            "nodes": [
                {"id": 3, "type": "KSampler",
                 "inputs": [{"name": "positive", "link": 4}, {"name": "negative", "link": 6}],
                 "widgets_values": [42, "fixed", 25, 7.5, "dpmpp_2m", "karras", 1.0]},
                {"id": 6, "type": "CLIPTextEncode", "widgets_values": ["castle at dusk"]},
                {"id": 7, "type": "CLIPTextEncode", "widgets_values": ["watermark"]},
                {"id": 4, "type": "CheckpointLoaderSimple", "widgets_values": ["sdxl.safetensors"]}
            ],
            "links": [[4, 6, 0, 3, 1, "CONDITIONING"], [6, 7, 0, 3, 2, "CONDITIONING"]]
        });
        let fields = summarize(&workflow);
        assert_eq!(fields.get(PROMPT), Some("castle at dusk"));
        assert_eq!(fields.get(NEGATIVE_PROMPT), Some("watermark"));
        assert_eq!(fields.get("Seed"), Some("42"));
        assert_eq!(fields.get("Steps"), Some("25"));
        assert_eq!(fields.get("Schedule type"), Some("karras"));
        assert_eq!(fields.get("Model"), Some("sdxl.safetensors"));
    }

    #[test]
    fn test_untraceable_prompts_fall_back_to_all_encoders() {
        let graph = json!({
            "1": {"class_type": "CLIPTextEncode", "inputs": {"text": "first"}},
            "2": {"class_type": "CLIPTextEncode", "inputs": {"text": "second"}}
        });
        assert_eq!(summarize(&graph).get(PROMPT), Some("first\n---\nsecond"));
    }

    #[test]
    fn test_is_graph() {
        assert!(is_graph(&api_prompt()));
        assert!(!is_graph(&json!({"prompt": "not a graph"})));
        assert!(!is_graph(&json!("text")));
    }
}
