use crate::core::config::data::Config;

impl Config {
    pub fn print_all(&self) {
        println!("Current configuration:");
        match &self.base_url {
            Some(url) => println!("  base-url: {url}"),
            None => println!("  base-url: (unset, using {})", self.base_url_or_default()),
        }
        match &self.default_model {
            Some(model) => println!("  default-model: {model}"),
            None => println!("  default-model: (unset)"),
        }
        match &self.system_prompt {
            Some(prompt) => println!("  system-prompt: {prompt}"),
            None => println!("  system-prompt: (default)"),
        }
        match self.temperature {
            Some(temperature) => println!("  temperature: {temperature}"),
            None => println!("  temperature: (default)"),
        }
        if self.custom_models.is_empty() {
            println!("  custom-models: (none)");
        } else {
            println!("  custom-models:");
            for model in &self.custom_models {
                println!("    {} ({} tokens)", model.id, model.token_limit);
            }
        }
    }
}
