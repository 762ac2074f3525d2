use quill_core::usage::ModelPricing;

/// Capabilities and pricing of a supported model.
#[derive(Clone, Debug)]
pub struct ModelInfo {
    pub id: &'static str,
    pub display_name: &'static str,
    pub context_window: usize,
    pub can_reason: bool,
    pub pricing: ModelPricing,
}

pub static GPT_5: ModelInfo = ModelInfo {
    id: "gpt-5",
    display_name: "GPT-5",
    context_window: 400_000,
    can_reason: true,
    pricing: ModelPricing {
        input_per_mtok: 1.25,
        output_per_mtok: 10.0,
        cache_read_per_mtok: 0.125,
        cache_write_per_mtok: 1.25,
    },
};

pub static GPT_5_MINI: ModelInfo = ModelInfo {
    id: "gpt-5-mini",
    display_name: "GPT-5 mini",
    context_window: 400_000,
    can_reason: true,
    pricing: ModelPricing {
        input_per_mtok: 0.25,
        output_per_mtok: 2.0,
        cache_read_per_mtok: 0.025,
        cache_write_per_mtok: 0.25,
    },
};

pub static GPT_4_1: ModelInfo = ModelInfo {
    id: "gpt-4.1",
    display_name: "GPT-4.1",
    context_window: 1_047_576,
    can_reason: false,
    pricing: ModelPricing {
        input_per_mtok: 2.0,
        output_per_mtok: 8.0,
        cache_read_per_mtok: 0.5,
        cache_write_per_mtok: 2.0,
    },
};

pub static GPT_OSS_120B: ModelInfo = ModelInfo {
    id: "openai/gpt-oss-120b",
    display_name: "GPT-OSS 120B",
    context_window: 131_072,
    can_reason: true,
    pricing: ModelPricing {
        input_per_mtok: 0.15,
        output_per_mtok: 0.75,
        cache_read_per_mtok: 0.075,
        cache_write_per_mtok: 0.15,
    },
};

static ALL_MODELS: &[&ModelInfo] = &[&GPT_5, &GPT_5_MINI, &GPT_4_1, &GPT_OSS_120B];

pub fn find_model(id: &str) -> Option<&'static ModelInfo> {
    ALL_MODELS.iter().find(|m| m.id == id).copied()
}

pub fn default_model() -> &'static ModelInfo {
    &GPT_5_MINI
}

pub fn all_models() -> &'static [&'static ModelInfo] {
    ALL_MODELS
}

/// Pricing for `id`; unknown models are free so usage is still counted.
pub fn pricing_for(id: &str) -> ModelPricing {
    find_model(id).map(|m| m.pricing).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_known_models() {
        assert!(find_model("gpt-5").is_some());
        assert!(find_model("openai/gpt-oss-120b").is_some());
        assert!(find_model("nonexistent").is_none());
    }

    #[test]
    fn unknown_model_costs_nothing() {
        assert_eq!(pricing_for("mystery"), ModelPricing::default());
        assert_eq!(pricing_for("gpt-5").output_per_mtok, 10.0);
    }

    #[test]
    fn ids_are_unique() {
        let mut ids: Vec<_> = all_models().iter().map(|m| m.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), all_models().len());
    }
}
