//! Persisted compiled artifact.
//!
//! Layout: `[u32 LE len][Contract][u32 LE len][Namespace]`, each section
//! encoded with postcard. Decoding an artifact and running it gives the same
//! result and gas as running the freshly compiled contract.

use crate::bytecode::ir::Contract;
use crate::namespace::Namespace;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact truncated at byte {0}")]
    Truncated(usize),

    #[error("artifact section does not fit in a u32 length")]
    TooLarge,

    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
}

pub fn encode(contract: &Contract, namespace: &Namespace) -> Result<Vec<u8>, ArtifactError> {
    let mut out = Vec::new();
    write_section(&mut out, &postcard::to_allocvec(contract)?)?;
    write_section(&mut out, &postcard::to_allocvec(namespace)?)?;
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<(Contract, Namespace), ArtifactError> {
    let mut at = 0;
    let contract = postcard::from_bytes(read_section(bytes, &mut at)?)?;
    let namespace = postcard::from_bytes(read_section(bytes, &mut at)?)?;
    Ok((contract, namespace))
}

fn write_section(out: &mut Vec<u8>, section: &[u8]) -> Result<(), ArtifactError> {
    let len = u32::try_from(section.len()).map_err(|_| ArtifactError::TooLarge)?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(section);
    Ok(())
}

fn read_section<'a>(bytes: &'a [u8], at: &mut usize) -> Result<&'a [u8], ArtifactError> {
    let header: [u8; 4] = bytes
        .get(*at..*at + 4)
        .and_then(|h| h.try_into().ok())
        .ok_or(ArtifactError::Truncated(*at))?;
    let len = u32::from_le_bytes(header) as usize;
    let start = *at + 4;
    let section = bytes
        .get(start..start + len)
        .ok_or(ArtifactError::Truncated(start))?;
    *at = start + len;
    Ok(section)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::VarInfo;
    use crate::lang::types::Type;
    use crate::namespace::Symbols;

    fn sample() -> (Contract, Namespace) {
        let mut contract = Contract::new("Sample");
        contract.code = vec![1, 2, 3, 0xffff];
        contract.params.insert(
            "amount".into(),
            VarInfo {
                index: 0,
                ty: Type::MONEY,
            },
        );
        let mut namespace = Namespace::new();
        namespace.link_contract("Sample", 0);
        (contract, namespace)
    }

    #[test]
    fn test_encode_decode() {
        let (contract, namespace) = sample();
        let bytes = encode(&contract, &namespace).unwrap();
        let (decoded, decoded_ns) = decode(&bytes).unwrap();
        assert_eq!(decoded, contract);
        assert_eq!(decoded_ns, namespace);
        assert_eq!(decoded_ns.contract("Sample"), Some(0));
    }

    #[test]
    fn test_layout_prefixes_lengths() {
        let (contract, namespace) = sample();
        let bytes = encode(&contract, &namespace).unwrap();
        let first = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(first, postcard::to_allocvec(&contract).unwrap().len());
    }

    #[test]
    fn test_truncated() {
        let (contract, namespace) = sample();
        let bytes = encode(&contract, &namespace).unwrap();
        assert!(matches!(decode(&bytes[..2]), Err(ArtifactError::Truncated(0))));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(ArtifactError::Truncated(_))
        ));
    }
}
