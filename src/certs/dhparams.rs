/// Built-in DH parameters (RFC 7919 ffdhe4096) written to every site's
/// `dhparams.pem` until an admin imports a custom set. Imports equal to
/// this constant are rejected so the state only carries real overrides.
pub const DEFAULT_DH_PARAMS: &str = "-----BEGIN DH PARAMETERS-----
MIICCAKCAgEA//////////+t+FRYortKmq/cViAnPTzx2LnFg84tNpWp4TZBFGQz
+8yTnc4kmz75fS/jY2MMddj2gbICrsRhetPfHtXV/WVhJDP1H18GbtCFY2VVPe0a
87VXE15/V8k1mE8McODmi3fipona8+/och3xWKE2rec1MKzKT0g6eXq8CrGCsyT7
YdEIqUuyyOP7uWrat2DX9GgdT0Kj3jlN9K5W7edjcrsZCwenyO4KbXCeAvzhzffi
7MA0BM0oNC9hkXL+nOmFg/+OTxIy7vKBg8P+OxtMb61zO7X8vC7CIAXFjvGDfRaD
ssbzSibBsu/6iGtCOGEoXJf//////////wIBAg==
-----END DH PARAMETERS-----
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_pem_shaped() {
        assert!(DEFAULT_DH_PARAMS.starts_with("-----BEGIN DH PARAMETERS-----"));
        assert!(DEFAULT_DH_PARAMS.trim_end().ends_with("-----END DH PARAMETERS-----"));
    }
}
