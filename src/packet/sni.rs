//! TLS ClientHello `server_name` extraction.
//!
//! Walks the unencrypted handshake far enough to reach the extensions block.
//! Every length prefix is bounds-checked; a short or malformed buffer simply
//! yields `None`.

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0;

/// Extract the first hostname carried in a ClientHello `server_name`
/// extension, if `payload` starts with one.
pub fn extract(payload: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(payload);

    // TLS record header: type, version (2), length (2).
    if cursor.take_u8()? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    cursor.skip(2)?;
    let record_len = cursor.take_u16()? as usize;
    let limit = cursor.pos.checked_add(record_len)?.min(payload.len());

    // Handshake header: type, length (3).
    if cursor.take_u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    cursor.skip(3)?;

    // client_version + random.
    cursor.skip(2 + 32)?;

    // session_id, cipher_suites, compression_methods.
    let session_len = cursor.take_u8()? as usize;
    cursor.skip(session_len)?;
    let ciphers_len = cursor.take_u16()? as usize;
    cursor.skip(ciphers_len)?;
    let compression_len = cursor.take_u8()? as usize;
    cursor.skip(compression_len)?;

    let extensions_len = cursor.take_u16()? as usize;
    let extensions_end = cursor.pos.checked_add(extensions_len)?.min(limit);

    while cursor.pos + 4 <= extensions_end {
        let ext_type = cursor.take_u16()?;
        let ext_len = cursor.take_u16()? as usize;
        let ext_end = cursor.pos.checked_add(ext_len)?;
        if ext_end > extensions_end {
            return None;
        }
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_list(&payload[cursor.pos..ext_end]);
        }
        cursor.pos = ext_end;
    }
    None
}

fn parse_server_name_list(data: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(data);
    let list_len = cursor.take_u16()? as usize;
    let list_end = cursor.pos.checked_add(list_len)?.min(data.len());
    while cursor.pos + 3 <= list_end {
        let name_type = cursor.take_u8()?;
        let name_len = cursor.take_u16()? as usize;
        let name_end = cursor.pos.checked_add(name_len)?;
        if name_end > list_end {
            return None;
        }
        if name_type == NAME_TYPE_HOST {
            return String::from_utf8(data[cursor.pos..name_end].to_vec()).ok();
        }
        cursor.pos = name_end;
    }
    None
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take_u8(&mut self) -> Option<u8> {
        let value = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(value)
    }

    fn take_u16(&mut self) -> Option<u16> {
        if self.pos + 2 > self.data.len() {
            return None;
        }
        let value = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Some(value)
    }

    fn skip(&mut self, count: usize) -> Option<()> {
        let next = self.pos.checked_add(count)?;
        if next > self.data.len() {
            return None;
        }
        self.pos = next;
        Some(())
    }
}

#[cfg(test)]
pub(crate) fn build_client_hello(host: &str) -> Vec<u8> {
    // server_name extension body.
    let name = host.as_bytes();
    let mut server_name_ext = Vec::new();
    server_name_ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
    server_name_ext.push(NAME_TYPE_HOST);
    server_name_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    server_name_ext.extend_from_slice(name);

    let mut extensions = Vec::new();
    // A leading unrelated extension to exercise the walk.
    extensions.extend_from_slice(&0x000Au16.to_be_bytes()); // supported_groups
    extensions.extend_from_slice(&4u16.to_be_bytes());
    extensions.extend_from_slice(&[0x00, 0x02, 0x00, 0x17]);
    extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(server_name_ext.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&server_name_ext);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // client_version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session_id
    body.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1); // compression_methods
    body.push(0);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(HANDSHAKE_CLIENT_HELLO);
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]); // 24-bit length
    handshake.extend_from_slice(&body);

    let mut record = Vec::new();
    record.push(CONTENT_TYPE_HANDSHAKE);
    record.extend_from_slice(&[0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_hostname() {
        let hello = build_client_hello("example.com");
        assert_eq!(extract(&hello).as_deref(), Some("example.com"));
    }

    #[test]
    fn truncated_record_returns_none() {
        let hello = build_client_hello("example.com");
        assert_eq!(extract(&hello[..12]), None);
    }

    #[test]
    fn non_handshake_returns_none() {
        let mut hello = build_client_hello("example.com");
        hello[0] = 0x17; // application data
        assert_eq!(extract(&hello), None);
    }

    #[test]
    fn non_client_hello_returns_none() {
        let mut hello = build_client_hello("example.com");
        hello[5] = 0x02; // server hello
        assert_eq!(extract(&hello), None);
    }

    #[test]
    fn corrupt_extension_length_returns_none() {
        let mut hello = build_client_hello("example.com");
        let len = hello.len();
        // Inflate the host-name length past the extension body.
        hello[len - ("example.com".len() + 2)] = 0xFF;
        assert_eq!(extract(&hello), None);
    }
}
