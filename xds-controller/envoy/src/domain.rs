/// A third-party upstream addressed by DNS, as annotated on its Service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamDomain {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl UpstreamDomain {
    /// Parses `https://host[:port]`, `http://host[:port]` or `host[:port]`.
    ///
    /// Without an explicit port, https defaults to 443, http to 80, and a bare
    /// host to `default_port`. Any path is ignored.
    pub fn parse(domain: &str, default_port: u16) -> Option<Self> {
        let domain = domain.trim();
        let (rest, tls, scheme_port) = if let Some(rest) = strip_scheme(domain, "https://") {
            (rest, true, 443)
        } else if let Some(rest) = strip_scheme(domain, "http://") {
            (rest, false, 80)
        } else {
            (domain, false, default_port)
        };

        let authority = rest.split(['/', '?']).next()?;
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, scheme_port),
        };
        if host.is_empty() || port == 0 {
            return None;
        }

        Some(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

fn strip_scheme<'d>(domain: &'d str, scheme: &str) -> Option<&'d str> {
    let prefix = domain.get(..scheme.len())?;
    prefix
        .eq_ignore_ascii_case(scheme)
        .then(|| &domain[scheme.len()..])
}
