use indexmap::IndexMap;

/// Concrete shape a parameter's value takes once parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDataType {
    Integer,
    Decimal,
    Boolean,
    Text,
    Dropdown,
    Image,
    ImageList,
    Model,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericWidth {
    W32,
    W64,
}

pub type CleanFn = fn(Option<&str>, &str) -> String;
pub type FormatFn = fn(&str) -> String;

/// Per-parameter descriptor consumed by the engine's typed map.
///
/// `clean` runs before anything else on raw input; `ignore_if` is
/// compared against the post-clean textual value and deletes the key
/// on match. `feature_flag` is added to the request's required-flags
/// set on assignment and never removed.
#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    pub id: String,
    pub data_type: ParamDataType,
    pub numeric_width: NumericWidth,
    pub default: Option<String>,
    pub clean: Option<CleanFn>,
    pub ignore_if: Option<String>,
    pub feature_flag: Option<String>,
    pub subtype: Option<String>,
    pub hide_from_metadata: bool,
    pub metadata_format: Option<FormatFn>,
}

impl ParamDescriptor {
    pub fn new(id: &str, data_type: ParamDataType) -> Self {
        Self {
            id: id.to_string(),
            data_type,
            numeric_width: NumericWidth::W64,
            default: None,
            clean: None,
            ignore_if: None,
            feature_flag: None,
            subtype: None,
            hide_from_metadata: false,
            metadata_format: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParamRegistry {
    params: IndexMap<String, ParamDescriptor>,
}

impl ParamRegistry {
    pub fn new(params: IndexMap<String, ParamDescriptor>) -> Self {
        Self { params }
    }

    pub fn get(&self, id: &str) -> Option<&ParamDescriptor> {
        self.params.get(id)
    }

    pub fn require(&self, id: &str) -> anyhow::Result<&ParamDescriptor> {
        self.params
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("unknown parameter '{id}'"))
    }

    pub fn list(&self) -> impl Iterator<Item = &ParamDescriptor> {
        self.params.values()
    }

    pub fn insert(&mut self, descriptor: ParamDescriptor) {
        self.params.insert(descriptor.id.clone(), descriptor);
    }
}

/// The stock descriptor set for a generation request.
pub fn standard_params() -> ParamRegistry {
    let mut map = IndexMap::new();

    let mut insert = |descriptor: ParamDescriptor| {
        map.insert(descriptor.id.clone(), descriptor);
    };

    insert(ParamDescriptor {
        default: Some(String::new()),
        ..ParamDescriptor::new("prompt", ParamDataType::Text)
    });
    insert(ParamDescriptor {
        default: Some(String::new()),
        ..ParamDescriptor::new("negativeprompt", ParamDataType::Text)
    });
    insert(ParamDescriptor {
        default: Some("-1".to_string()),
        ..ParamDescriptor::new("seed", ParamDataType::Integer)
    });
    insert(ParamDescriptor {
        ignore_if: Some("-1".to_string()),
        feature_flag: Some("variation_seed".to_string()),
        ..ParamDescriptor::new("variation_seed", ParamDataType::Integer)
    });
    insert(ParamDescriptor {
        default: Some("0".to_string()),
        ignore_if: Some("0".to_string()),
        ..ParamDescriptor::new("variation_seed_strength", ParamDataType::Decimal)
    });
    insert(ParamDescriptor {
        ignore_if: Some("-1".to_string()),
        ..ParamDescriptor::new("wildcard_seed", ParamDataType::Integer)
    });
    insert(ParamDescriptor {
        numeric_width: NumericWidth::W32,
        default: Some("1".to_string()),
        ..ParamDescriptor::new("images", ParamDataType::Integer)
    });
    insert(ParamDescriptor {
        numeric_width: NumericWidth::W32,
        default: Some("20".to_string()),
        ..ParamDescriptor::new("steps", ParamDataType::Integer)
    });
    insert(ParamDescriptor {
        default: Some("7".to_string()),
        metadata_format: Some(format_decimal_text),
        ..ParamDescriptor::new("cfg_scale", ParamDataType::Decimal)
    });
    insert(ParamDescriptor {
        default: Some("euler".to_string()),
        clean: Some(clean_lowercase),
        ..ParamDescriptor::new("sampler", ParamDataType::Dropdown)
    });
    insert(ParamDescriptor {
        numeric_width: NumericWidth::W32,
        default: Some("512".to_string()),
        ..ParamDescriptor::new("width", ParamDataType::Integer)
    });
    insert(ParamDescriptor {
        numeric_width: NumericWidth::W32,
        default: Some("512".to_string()),
        ..ParamDescriptor::new("height", ParamDataType::Integer)
    });
    insert(ParamDescriptor {
        clean: Some(clean_resolution),
        hide_from_metadata: true,
        ..ParamDescriptor::new("raw_resolution", ParamDataType::Text)
    });
    insert(ParamDescriptor {
        default: Some("1".to_string()),
        ignore_if: Some("1".to_string()),
        ..ParamDescriptor::new("alt_resolution_height_mult", ParamDataType::Decimal)
    });
    insert(ParamDescriptor {
        subtype: Some("Stable-Diffusion".to_string()),
        ..ParamDescriptor::new("model", ParamDataType::Model)
    });
    insert(ParamDescriptor {
        subtype: Some("Stable-Diffusion".to_string()),
        ignore_if: Some("(none)".to_string()),
        feature_flag: Some("refiner".to_string()),
        ..ParamDescriptor::new("refiner_model", ParamDataType::Model)
    });
    insert(ParamDescriptor::new("loras", ParamDataType::List));
    insert(ParamDescriptor::new("lora_weights", ParamDataType::List));
    insert(ParamDescriptor {
        hide_from_metadata: true,
        ..ParamDescriptor::new("lora_section_confinement", ParamDataType::List)
    });
    insert(ParamDescriptor::new("init_image", ParamDataType::Image));
    insert(ParamDescriptor::new(
        "reference_images",
        ParamDataType::ImageList,
    ));
    insert(ParamDescriptor {
        hide_from_metadata: true,
        ..ParamDescriptor::new("internalbackendtype", ParamDataType::Text)
    });
    insert(ParamDescriptor {
        hide_from_metadata: true,
        feature_flag: Some("exact_backend".to_string()),
        ..ParamDescriptor::new("exactbackendid", ParamDataType::Text)
    });

    ParamRegistry::new(map)
}

fn clean_lowercase(_prev: Option<&str>, new: &str) -> String {
    new.trim().to_ascii_lowercase()
}

fn clean_resolution(_prev: Option<&str>, new: &str) -> String {
    new.chars()
        .filter(|ch| !ch.is_whitespace())
        .map(|ch| if ch == 'X' { 'x' } else { ch })
        .collect()
}

fn format_decimal_text(raw: &str) -> String {
    match raw.parse::<f64>() {
        Ok(value) if value.fract() == 0.0 => format!("{}", value as i64),
        _ => raw.to_string(),
    }
}
