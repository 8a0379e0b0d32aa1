//! Configuration validation

use super::Config;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            eprintln!("[WARN] {}", warning);
        }
        for error in &self.errors {
            eprintln!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_tunnel(config, &mut result);
    validate_port_forward(config, &mut result);

    result
}

fn validate_tunnel(config: &Config, result: &mut ValidationResult) {
    if config.tunnel.interface.is_empty() {
        result.error("tunnel.interface must not be empty");
    }

    match super::parse_cidr(&config.tunnel.address_v4) {
        Ok((_, prefix)) => {
            if prefix > 30 {
                result.warn(format!(
                    "tunnel.address_v4: /{} leaves no room for peer addresses",
                    prefix
                ));
            }
        }
        Err(_) => {
            result.error(format!(
                "tunnel.address_v4: not a valid CIDR: {}",
                config.tunnel.address_v4
            ));
        }
    }

    if config.tunnel.listen_port == 0 {
        result.error("tunnel.listen_port must be nonzero");
    }

    if config.tunnel.endpoint.is_empty() {
        result.warn(
            "tunnel.endpoint not set; NAT-PMP public-address replies will report 0.0.0.0",
        );
    }
}

fn validate_port_forward(config: &Config, result: &mut ValidationResult) {
    let pf = &config.port_forward;

    if !pf.enabled {
        return;
    }

    if pf.min_port == 0 {
        result.error("port_forward.min_port must be nonzero");
    }

    if pf.min_port > pf.max_port {
        result.error(format!(
            "port_forward: min_port {} exceeds max_port {}",
            pf.min_port, pf.max_port
        ));
    }

    if pf.min_port < 1024 {
        result.warn(format!(
            "port_forward.min_port {} allows privileged ports to be claimed by clients",
            pf.min_port
        ));
    }

    if pf.max_per_client == 0 {
        result.error("port_forward.max_per_client must be nonzero");
    }

    if pf.default_lifetime == 0 {
        result.warn("port_forward.default_lifetime is 0; admin-created mappings expire immediately");
    }
}

#[cfg(test)]
mod tests {
    use super::super::Config;
    use super::*;

    fn parse(toml: &str) -> Config {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn test_default_config_valid() {
        let result = validate(&Config::default());
        assert!(!result.has_errors());
    }

    #[test]
    fn test_bad_cidr_rejected() {
        let config = parse(
            r#"
            [tunnel]
            address_v4 = "not-a-cidr"
            "#,
        );
        let result = validate(&config);
        assert!(result.has_errors());
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let config = parse(
            r#"
            [port_forward]
            enabled = true
            min_port = 40000
            max_port = 30000
            "#,
        );
        let result = validate(&config);
        assert!(result.has_errors());
    }

    #[test]
    fn test_zero_quota_rejected() {
        let config = parse(
            r#"
            [port_forward]
            enabled = true
            max_per_client = 0
            "#,
        );
        let result = validate(&config);
        assert!(result.has_errors());
    }

    #[test]
    fn test_disabled_port_forward_skips_checks() {
        let config = parse(
            r#"
            [port_forward]
            enabled = false
            min_port = 40000
            max_port = 30000
            "#,
        );
        let result = validate(&config);
        assert!(!result.has_errors());
    }

    #[test]
    fn test_missing_endpoint_warns() {
        let result = validate(&Config::default());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("tunnel.endpoint")));
    }
}
