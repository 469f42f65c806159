//! RSA signature primitives for archive signing and verification
//!
//! MPQ signatures use raw modular exponentiation with format-specific
//! padding, so the RSA arithmetic lives here on `num-bigint` rather
//! than behind a general-purpose RSA crate. Signatures are stored
//! byte-reversed (little-endian) on disk.

use crate::{Error, Result};
use num_bigint::BigUint;
use num_traits::Num;

/// Size of the weak signature proper (512-bit RSA)
pub const WEAK_SIGNATURE_SIZE: usize = 64;

/// Size of the whole (signature) file: 8 reserved bytes + signature
pub const WEAK_SIGNATURE_FILE_SIZE: usize = 72;

/// Size of the strong signature without its 'NGIS' magic
pub const STRONG_SIGNATURE_SIZE: usize = 256;

/// The well-known 512-bit key used for weak signatures
///
/// Both halves of this key are public knowledge, which is why weak
/// signatures authenticate nothing and are only an integrity check.
pub mod weak_key {
    /// Modulus
    pub const N: &str =
        "92627704bfb882cc0523b90cb1ac0459272175968d025eda47dd7c49371bf8faeb0e0a92167557ad51b78ccb68c5426290ee9fb14bc118e430349ea4ed6ad837";
    /// Public exponent
    pub const E: u32 = 0x10001;
    /// Private exponent
    pub const D: &str =
        "36d8b3b550cc261da11358633c32b2526109f54fda3778289ae28e8db41b43f6d659c33f59f85254798faadaa1fdb408d945c5af4ae75e781eb5e6472ebfdbf1";
}

/// The 2048-bit moduli tried for strong signatures, all with e = 65537
pub mod strong_keys {
    /// Blizzard strong archive key
    pub const BLIZZARD: &str =
        "b1067ece24f687c87e27f88c42981db47d47689cce044dda823538c8c3dcae2c5a3ce668038b7c6f07decbba9ccdf5b2c28718a37a657b2b4517e22e0f81c3165f4e5cdd52172ba94a0331d441999606c50289a76eaf4c409c8ca90b4c8510231608384e7752ed835bf893120042a991736a636f27fc45411c3e53b0cb9508be7bf6021e9dbafad5d23dd830c4772efdd08cc81b454a58b87f28e4dc4c97e60ecffb1d04e41a8b955be594b1f7a4baa350a3b343f4306784b8cb8e9b71785136019a98700d5aa374bd2cddc62f5b569555c5217f5cedf5aa6954d0959da836c23f011540a4e2b782b360aafc07e98a156155e3349128e6c409b0fb1d57f86477";
    /// Warcraft III map key
    pub const WARCRAFT3_MAP: &str =
        "d41c24954510dd4be38b3381468179cb239573b283fa818e407e62e9e524d727ecd25b820bbd2436e70dadfaa19af8b2c15b5a851b1ed49b5708faf1d9b77788df03c7dd5f6e4c636083864ec8d8a07293a7405b6859098a1efbe9f7078271526feee625c0ee255bc9397c441fac34d6fa3a56dba30aa8f56aba9bca86a5fb1b4069ccc5deeb3970e129e39b11d730164e7d7eee898ded5595e10a893da0d280148449cd25d60aced22d55512ba66b293bc8128891bf8b06f706e969d86470a2ed574b99ac444799bca197c447ae9b85e1e889240865ff4f018e86bb0d834f9053739e23fc068b40029fdaa7114a040b568e6441a75d177ac2a6c5e807fef8e9";
    /// WoW patch key
    pub const WOW_PATCH: &str =
        "c0eb0c5742da80058f12d11033a6fde851c5914c866dbc9d6b6fc37dcf5dca5db513d42f5fe630eea29130028fcc0d9395040b64abd7a6729717f6082b9c5ae6ec20f42107084018a252c6e319f4154384d04ff43eebb2b48d29d0809eeab934d0f89f6734ebf276b6c08fe5fc69d06ef9c8545d5c93a72c9404e9409e49255317ce8165500052d7d5844b0e0c5ee2404b701b321c4d59d12156fede3b9d5cc868d12f2f508e88193836536347d2124b2006a431342a18549608fec1792b67e50ec1aaac8a7439d27ab5e265ce0d585236276fa6ca8e589d5e81c45c8d93800fe60fa3b75c522dd3c23db3772b3824e0202abb7205f7e6aad988855665d46f4f";
    /// WoW survey key
    pub const WOW_SURVEY: &str =
        "9c8b750d1ea7472c8ab32daa6a11de30a2ed69c6ad9ff2b189e1dcc07f3bc0b0712b2fa3674832713989ed2693741004303b3f57920f21712da2a62789dd9ceb74e67c60d4f76a1cdcf8753d6519d8f5b10614f4e8763145d6eb807c3dfc8dbda4d3e2ffad3bc7e9733ce4484ce814051e8c47c6aef07b103f86e7e2f9093609d28288e1e3cfd740e07f700967ec0b359de3fad4d9958a6a0b4780708b7cedcdf82b65a529c9e34252b3982661f4f582236c1c924ed5ce5227683c78c5accb025a9afac6cf316c44dbb3b30914be9abdc51f4d3ebba9f219f51b2e29f9d725322b5749300d28e3b8d5e23d399601e852b221c8b2b5175f944d730b128c296b9d";
    /// Starcraft II map key
    pub const STARCRAFT2_MAP: &str =
        "9a4e064fccdbf88082db96b5eca641abfca02862765523ba213e4f1872659b529f9c7040e01e921f7c4c949e1ce9e1b693b41ebd9bfe14e863b001ee6f25aad952aa59bac814abf620b73645f327f09f440d5471bdcc61eac951ad52faf43d30d6d7d51a33222aad85ca6e721a845313b091803a9b01b5cff4b06c08d5878892f07f1306cc76e4f29225f6889ae69bccee87d96a6487721c65a72eb16b8189ef128dd3560236f9254cbd43eeea25df093070773bbeb17c430b898b3b80e5b4a0e29a041ad1fad8164e622f942ffcf4df560afa4f426d0c8cd17d29268268633d532be63927bbc19d7099b5f713610fd9ccde947314dae7b7496a23a50a1f739d";
}

/// An RSA public key for secure-signature verification
#[derive(Debug, Clone)]
pub struct RsaPublicKey {
    /// Modulus
    pub n: BigUint,
    /// Public exponent
    pub e: BigUint,
}

impl RsaPublicKey {
    /// Build a key from hex-encoded modulus and exponent
    pub fn from_hex(n: &str, e: u32) -> Result<Self> {
        let n = BigUint::from_str_radix(n, 16)
            .map_err(|e| Error::invalid_parameter(format!("bad RSA modulus: {}", e)))?;
        Ok(Self {
            n,
            e: BigUint::from(e),
        })
    }

    /// Modulus size in bytes
    pub fn size(&self) -> usize {
        (self.n.bits() as usize).div_ceil(8)
    }
}

/// ASN.1 DigestInfo prefix for MD5 under PKCS#1 v1.5
const MD5_DIGEST_INFO: [u8; 18] = [
    0x30, 0x20, 0x30, 0x0C, 0x06, 0x08, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x02, 0x05, 0x05,
    0x00, 0x04, 0x10,
];

/// ASN.1 DigestInfo prefix for SHA-1 under PKCS#1 v1.5
const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00, 0x04, 0x14,
];

/// EMSA-PKCS1-v1_5 encoding of a digest
fn pkcs1_v15_encode(digest: &[u8], digest_info: &[u8], em_len: usize) -> Result<Vec<u8>> {
    let t_len = digest_info.len() + digest.len();
    if em_len < t_len + 11 {
        return Err(Error::invalid_parameter("RSA modulus too small for digest"));
    }
    let mut em = Vec::with_capacity(em_len);
    em.push(0x00);
    em.push(0x01);
    em.resize(em_len - t_len - 1, 0xFF);
    em.push(0x00);
    em.extend_from_slice(digest_info);
    em.extend_from_slice(digest);
    Ok(em)
}

/// Raw RSA public operation on a reversed (little-endian) signature
fn public_op(reversed_signature: &[u8], n: &BigUint, e: &BigUint, em_len: usize) -> Vec<u8> {
    // Reversing the on-disk bytes yields big-endian; from_bytes_le does
    // both steps at once.
    let s = BigUint::from_bytes_le(reversed_signature);
    let m = s.modpow(e, n);
    let mut em = m.to_bytes_be();
    while em.len() < em_len {
        em.insert(0, 0);
    }
    em
}

/// Verify a weak (signature)-file signature against an archive MD5
pub fn verify_weak(signature_file: &[u8], md5_digest: &[u8; 16]) -> Result<bool> {
    if signature_file.len() < WEAK_SIGNATURE_FILE_SIZE {
        return Err(Error::corrupt("(signature) file too short"));
    }
    let n = BigUint::from_str_radix(weak_key::N, 16).expect("weak key modulus");
    let e = BigUint::from(weak_key::E);

    let em = public_op(&signature_file[8..8 + WEAK_SIGNATURE_SIZE], &n, &e, WEAK_SIGNATURE_SIZE);
    let expected = pkcs1_v15_encode(md5_digest, &MD5_DIGEST_INFO, WEAK_SIGNATURE_SIZE)?;
    Ok(em == expected)
}

/// Produce the 72-byte (signature) file contents for an archive MD5
pub fn sign_weak(md5_digest: &[u8; 16]) -> Result<Vec<u8>> {
    let n = BigUint::from_str_radix(weak_key::N, 16).expect("weak key modulus");
    let d = BigUint::from_str_radix(weak_key::D, 16).expect("weak key exponent");

    let em = pkcs1_v15_encode(md5_digest, &MD5_DIGEST_INFO, WEAK_SIGNATURE_SIZE)?;
    let m = BigUint::from_bytes_be(&em);
    let s = m.modpow(&d, &n);

    // Stored little-endian, padded to the full signature width
    let mut sig = s.to_bytes_le();
    sig.resize(WEAK_SIGNATURE_SIZE, 0);

    let mut out = vec![0u8; 8];
    out.extend_from_slice(&sig);
    Ok(out)
}

/// The expected strong-signature message: 0x0B, 0xBB padding, digest
fn strong_padded_digest(sha1_digest: &[u8; 20]) -> Vec<u8> {
    let mut padded = vec![0xBBu8; STRONG_SIGNATURE_SIZE];
    padded[0] = 0x0B;
    padded[STRONG_SIGNATURE_SIZE - 20..].copy_from_slice(sha1_digest);
    padded
}

/// Verify a strong signature against candidate SHA-1 digests
///
/// Each known public key is tried against each digest variant (the
/// variants differ in the tail string hashed after the archive).
pub fn verify_strong(signature: &[u8], digests: &[[u8; 20]]) -> Result<bool> {
    if signature.len() < STRONG_SIGNATURE_SIZE {
        return Err(Error::corrupt("strong signature too short"));
    }
    let e = BigUint::from(0x10001u32);

    for modulus in [
        strong_keys::BLIZZARD,
        strong_keys::WARCRAFT3_MAP,
        strong_keys::WOW_PATCH,
        strong_keys::WOW_SURVEY,
        strong_keys::STARCRAFT2_MAP,
    ] {
        let n = BigUint::from_str_radix(modulus, 16).expect("strong key modulus");
        let em = public_op(&signature[..STRONG_SIGNATURE_SIZE], &n, &e, STRONG_SIGNATURE_SIZE);
        for digest in digests {
            if em == strong_padded_digest(digest) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Verify a secure signature (SHA-1, caller-supplied key)
pub fn verify_secure(signature: &[u8], sha1_digest: &[u8; 20], key: &RsaPublicKey) -> Result<bool> {
    let size = key.size();
    if !(128..=512).contains(&size) {
        return Err(Error::invalid_parameter(
            "secure signature keys must be 1024 to 4096 bits",
        ));
    }
    if signature.len() < size {
        return Err(Error::corrupt("secure signature too short"));
    }

    let em = public_op(&signature[..size], &key.n, &key.e, size);
    let expected = pkcs1_v15_encode(sha1_digest, &SHA1_DIGEST_INFO, size)?;
    Ok(em == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_sign_verify_round_trip() {
        let digest = [0x42u8; 16];
        let file = sign_weak(&digest).unwrap();
        assert_eq!(file.len(), WEAK_SIGNATURE_FILE_SIZE);
        assert!(verify_weak(&file, &digest).unwrap());

        // A different digest must not verify
        let other = [0x43u8; 16];
        assert!(!verify_weak(&file, &other).unwrap());
    }

    #[test]
    fn test_weak_signature_tamper_detected() {
        let digest = [0x11u8; 16];
        let mut file = sign_weak(&digest).unwrap();
        file[20] ^= 0x01;
        assert!(!verify_weak(&file, &digest).unwrap());
    }

    #[test]
    fn test_pkcs1_encoding_shape() {
        let digest = [0xAAu8; 16];
        let em = pkcs1_v15_encode(&digest, &MD5_DIGEST_INFO, 64).unwrap();
        assert_eq!(em.len(), 64);
        assert_eq!(em[0], 0x00);
        assert_eq!(em[1], 0x01);
        assert_eq!(em[em.len() - 16..], digest);
    }

    #[test]
    fn test_strong_padded_digest_shape() {
        let digest = [0x55u8; 20];
        let padded = strong_padded_digest(&digest);
        assert_eq!(padded.len(), 256);
        assert_eq!(padded[0], 0x0B);
        assert_eq!(padded[1], 0xBB);
        assert_eq!(&padded[236..], &digest);
    }

    #[test]
    fn test_strong_verify_rejects_garbage() {
        let signature = vec![0x5Au8; STRONG_SIGNATURE_SIZE];
        let digests = [[0u8; 20]];
        assert!(!verify_strong(&signature, &digests).unwrap());
    }

    #[test]
    fn test_secure_key_size_bounds() {
        let key = RsaPublicKey::from_hex("ff", 0x10001).unwrap();
        let digest = [0u8; 20];
        assert!(verify_secure(&[0u8; 64], &digest, &key).is_err());
    }
}
