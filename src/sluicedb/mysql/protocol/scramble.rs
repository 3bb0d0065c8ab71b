use crypto::sha1::Sha1;
use crypto::digest::Digest;
use rand::Rng;

pub const SCRAMBLE_LEN: usize = 20;
pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

pub type Scramble = [u8; SCRAMBLE_LEN];
/// SHA1(SHA1(password)), what the server stores for mysql_native_password
pub type DoubleSha1 = [u8; SCRAMBLE_LEN];
/// SHA1(password), recovered from a valid client token and used to log in to the backends
pub type Phase2Token = [u8; SCRAMBLE_LEN];

/// Generates a random scramble of printable characters, no nulls or '$'
/// which some clients handle badly.
pub fn generate_scramble() -> Scramble {
    let mut rng = rand::thread_rng();
    let mut scramble = [0u8; SCRAMBLE_LEN];
    for b in scramble.iter_mut() {
        let mut c = rng.gen_range(0x21u8..0x7f);
        if c == b'$' {
            c = b'%';
        }
        *b = c;
    }
    scramble
}

pub fn sha1(parts: &[&[u8]]) -> [u8; SCRAMBLE_LEN] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.input(part);
    }
    let mut out = [0; SCRAMBLE_LEN];
    hasher.result(&mut out);
    out
}

/// The stored form of a password, "*" followed by uppercase hex of SHA1(SHA1(password)).
/// An empty password is stored as an empty string.
pub fn password_hash(password: &str) -> String {
    if password.is_empty() {
        return String::new();
    }
    let stage1 = sha1(&[password.as_bytes()]);
    let stage2 = sha1(&[&stage1[..]]);
    let mut s = String::with_capacity(41);
    s.push('*');
    s.push_str(&hex::encode_upper(stage2));
    s
}

/// Parses a stored "*HEX" hash. Returns None for an empty password, and an error marker
/// (Some(Err)) if the string isn't a valid hash.
pub fn parse_password_hash(stored: &str) -> Option<Result<DoubleSha1, ()>> {
    if stored.is_empty() {
        return None;
    }
    let hex_part = stored.strip_prefix('*').unwrap_or(stored);
    let mut out = [0u8; SCRAMBLE_LEN];
    match hex::decode_to_slice(hex_part, &mut out) {
        Ok(()) => Some(Ok(out)),
        Err(_) => Some(Err(())),
    }
}

fn xor(a: &[u8; SCRAMBLE_LEN], b: &[u8; SCRAMBLE_LEN]) -> [u8; SCRAMBLE_LEN] {
    let mut out = [0u8; SCRAMBLE_LEN];
    for i in 0..SCRAMBLE_LEN {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// The client token for a plaintext password: SHA1(pw) XOR SHA1(scramble + SHA1(SHA1(pw))).
pub fn scramble_password(scramble: &[u8], password: &str) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let phase2 = sha1(&[password.as_bytes()]);
    scramble_phase2(scramble, &phase2).to_vec()
}

/// The client token computed from SHA1(password), used when the proxy logs in to a backend
/// on behalf of a client.
pub fn scramble_phase2(scramble: &[u8], phase2: &Phase2Token) -> [u8; SCRAMBLE_LEN] {
    let stage2 = sha1(&[&phase2[..]]);
    let mix = sha1(&[scramble, &stage2[..]]);
    xor(phase2, &mix)
}

/// Checks a client token against the stored double hash. On success returns SHA1(password).
pub fn check_token(scramble: &[u8], token: &[u8], stored: &DoubleSha1) -> Option<Phase2Token> {
    if token.len() != SCRAMBLE_LEN {
        return None;
    }
    let mut tok = [0u8; SCRAMBLE_LEN];
    tok.copy_from_slice(token);
    let mix = sha1(&[scramble, &stored[..]]);
    let candidate = xor(&tok, &mix);
    if &sha1(&[&candidate[..]]) == stored {
        Some(candidate)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash() {
        assert_eq!(password_hash("password"), "*2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19");
        assert_eq!(password_hash(""), "");
    }

    #[test]
    fn test_check_token() {
        let scramble = generate_scramble();
        let token = scramble_password(&scramble, "hunter2");
        let stored = parse_password_hash(&password_hash("hunter2")).unwrap().unwrap();
        let phase2 = check_token(&scramble, &token, &stored).expect("token should match");
        assert_eq!(phase2, sha1(&[&b"hunter2"[..]]));
        // The recovered SHA1(pw) produces the same token for the same scramble
        assert_eq!(scramble_phase2(&scramble, &phase2).to_vec(), token);

        let wrong = scramble_password(&scramble, "hunter3");
        assert!(check_token(&scramble, &wrong, &stored).is_none());
        assert!(check_token(&scramble, &[], &stored).is_none());
    }

    #[test]
    fn test_generate_scramble() {
        let s = generate_scramble();
        assert!(s.iter().all(|&b| b != 0 && b != b'$' && b < 0x7f));
    }

    #[test]
    fn test_parse_invalid_hash() {
        assert_eq!(parse_password_hash("*XYZ"), Some(Err(())));
        assert_eq!(parse_password_hash(""), None);
    }
}
