/// The pod-side port a service port maps to. May be a literal number or a
/// name resolved against an `Endpoints` subset's named ports.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetPort {
    Number(u16),
    Name(String),
}

impl TargetPort {
    /// Derives the `TargetPort` for a service port from the service's port
    /// spec, per spec.md §4.2: "if a named or non-zero target port is
    /// specified use it, else default target=service port".
    pub fn from_spec(service_port: u16, target_port_name: Option<&str>, target_port_number: u16) -> Self {
        if let Some(name) = target_port_name.filter(|n| !n.is_empty()) {
            return TargetPort::Name(name.to_string());
        }
        if target_port_number != 0 {
            return TargetPort::Number(target_port_number);
        }
        TargetPort::Number(service_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_target_port_wins() {
        assert_eq!(
            TargetPort::from_spec(80, Some("http"), 0),
            TargetPort::Name("http".to_string())
        );
    }

    #[test]
    fn numeric_target_port_used_when_nonzero() {
        assert_eq!(TargetPort::from_spec(80, None, 8080), TargetPort::Number(8080));
    }

    #[test]
    fn defaults_to_service_port() {
        assert_eq!(TargetPort::from_spec(80, None, 0), TargetPort::Number(80));
    }
}
