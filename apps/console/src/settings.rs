use std::collections::HashMap;
use std::fs;

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: String,
    pub admin_token: Option<String>,
    pub teacher_token: Option<String>,
    pub student_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000".into(),
            admin_token: None,
            teacher_token: None,
            student_token: None,
        }
    }
}

/// Settings come from `console.toml` in the working directory, overridden by
/// environment variables. Exactly one role token is expected to be set.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("console.toml") {
        apply_file(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("CAMPUS_API_URL") {
        settings.api_url = v;
    }
    if let Ok(v) = std::env::var("CAMPUS_ADMIN_TOKEN") {
        settings.admin_token = Some(v);
    }
    if let Ok(v) = std::env::var("CAMPUS_TEACHER_TOKEN") {
        settings.teacher_token = Some(v);
    }
    if let Ok(v) = std::env::var("CAMPUS_STUDENT_TOKEN") {
        settings.student_token = Some(v);
    }

    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("api_url") {
        settings.api_url = v.clone();
    }
    if let Some(v) = file_cfg.get("admin_token") {
        settings.admin_token = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("teacher_token") {
        settings.teacher_token = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("student_token") {
        settings.student_token = Some(v.clone());
    }
}
