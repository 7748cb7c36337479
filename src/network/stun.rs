//! Minimal STUN binding support (RFC 5389 subset)
//!
//! Only what candidate gathering needs: build a binding request, recognize
//! a binding response on the data socket, and extract the mapped address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::error::NetworkError;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const MAGIC_COOKIE: u32 = 0x2112_A442;

const HEADER_SIZE: usize = 20;

/// Build a binding request with the given transaction id
pub fn binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_SIZE);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);
    msg
}

/// Quick check for demultiplexing a binding response off a shared socket
pub fn is_binding_response(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE
        && u16::from_be_bytes([data[0], data[1]]) == BINDING_RESPONSE
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

/// Extract the transaction id of a binding response
pub fn response_transaction_id(data: &[u8]) -> Option<[u8; 12]> {
    if !is_binding_response(data) {
        return None;
    }
    data[8..HEADER_SIZE].try_into().ok()
}

/// Parse the mapped address out of a binding response
pub fn mapped_address(
    data: &[u8],
    transaction_id: &[u8; 12],
) -> Result<SocketAddr, NetworkError> {
    if !is_binding_response(data) {
        return Err(NetworkError::StunFailed("Not a binding response".to_string()));
    }
    if &data[8..HEADER_SIZE] != transaction_id {
        return Err(NetworkError::StunFailed(
            "Transaction id mismatch".to_string(),
        ));
    }

    let body_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let body = data
        .get(HEADER_SIZE..HEADER_SIZE + body_len)
        .ok_or_else(|| NetworkError::StunFailed("Truncated response".to_string()))?;

    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let Some(value) = body.get(offset + 4..offset + 4 + attr_len) else {
            break;
        };

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return xor_mapped(value, transaction_id),
            ATTR_MAPPED_ADDRESS => return plain_mapped(value),
            _ => {}
        }

        // Attributes are padded to 4-byte boundaries
        offset += 4 + ((attr_len + 3) & !3);
    }

    Err(NetworkError::StunFailed(
        "No mapped address attribute".to_string(),
    ))
}

fn xor_mapped(value: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr, NetworkError> {
    if value.len() < 8 {
        return Err(NetworkError::StunFailed("Attribute too short".to_string()));
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;

    match value[1] {
        0x01 => {
            let raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            let ip = Ipv4Addr::from(raw ^ MAGIC_COOKIE);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(NetworkError::StunFailed("Attribute too short".to_string()));
            }
            // IPv6 addresses are XOR'd with cookie || transaction id
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ mask[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        family => Err(NetworkError::StunFailed(format!(
            "Unknown address family: {}",
            family
        ))),
    }
}

fn plain_mapped(value: &[u8]) -> Result<SocketAddr, NetworkError> {
    if value.len() < 8 {
        return Err(NetworkError::StunFailed("Attribute too short".to_string()));
    }
    let port = u16::from_be_bytes([value[2], value[3]]);

    match value[1] {
        0x01 => Ok(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(value[4], value[5], value[6], value[7])),
            port,
        )),
        0x02 => {
            if value.len() < 20 {
                return Err(NetworkError::StunFailed("Attribute too short".to_string()));
            }
            let octets: [u8; 16] = value[4..20].try_into().unwrap();
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        family => Err(NetworkError::StunFailed(format!(
            "Unknown address family: {}",
            family
        ))),
    }
}
