use log::warn;

const EDID_MIN_LEN: usize = 128;
const DESCRIPTOR_BASE: usize = 54;
const DESCRIPTOR_LEN: usize = 18;
const DESCRIPTOR_NAME: u8 = 0xFC;
const DESCRIPTOR_SERIAL: u8 = 0xFF;

/// Identity fields decoded from a monitor's EDID blob.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Edid {
    /// Three-letter PNP vendor id, e.g. "DEL".
    pub pnp_id: Option<String>,
    /// Monitor name from the name descriptor block.
    pub name: Option<String>,
    /// Serial string from the serial descriptor block.
    pub serial: Option<String>,
}

impl Edid {
    /// Decode the identity descriptors of a raw EDID blob.
    ///
    /// Returns `None` for blobs shorter than one EDID block; individual
    /// missing descriptors simply stay unset.
    pub fn parse(edid: &[u8]) -> Option<Edid> {
        if edid.len() < EDID_MIN_LEN {
            warn!("EDID blob too short: {} bytes", edid.len());
            return None;
        }

        // Manufacturer id: bytes 8-9, big-endian, three 5-bit letters.
        let mfg = u16::from_be_bytes([edid[8], edid[9]]);
        let c1 = (((mfg >> 10) & 0x1F) as u8 + 0x40) as char;
        let c2 = (((mfg >> 5) & 0x1F) as u8 + 0x40) as char;
        let c3 = ((mfg & 0x1F) as u8 + 0x40) as char;
        let pnp_id = if c1.is_ascii_uppercase() && c2.is_ascii_uppercase() && c3.is_ascii_uppercase()
        {
            Some(format!("{c1}{c2}{c3}"))
        } else {
            None
        };

        let mut name = None;
        let mut serial = None;
        let mut offset = DESCRIPTOR_BASE;
        while offset + DESCRIPTOR_LEN <= EDID_MIN_LEN.min(edid.len()) {
            let block = &edid[offset..offset + DESCRIPTOR_LEN];
            // Display descriptors start with a zero pixel clock.
            if block[0] == 0 && block[1] == 0 {
                match block[3] {
                    DESCRIPTOR_NAME => {
                        let text = descriptor_text(&block[5..18]);
                        if !text.is_empty() {
                            name = Some(text);
                        }
                    }
                    DESCRIPTOR_SERIAL => {
                        let text = descriptor_text(&block[5..18]);
                        if !text.is_empty() {
                            serial = Some(text);
                        }
                    }
                    _ => {}
                }
            }
            offset += DESCRIPTOR_LEN;
        }

        Some(Edid {
            pnp_id,
            name,
            serial,
        })
    }
}

fn descriptor_text(bytes: &[u8]) -> String {
    let text: Vec<u8> = bytes
        .iter()
        .copied()
        .take_while(|&b| b != 0x0A && b != 0x00)
        .collect();
    String::from_utf8_lossy(&text).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_edid() -> Vec<u8> {
        let mut edid = vec![0u8; 128];
        edid[0..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
        // "DEL": D=4, E=5, L=12
        let mfg: u16 = (4 << 10) | (5 << 5) | 12;
        edid[8..10].copy_from_slice(&mfg.to_be_bytes());
        // Name descriptor in the first block.
        edid[54] = 0;
        edid[55] = 0;
        edid[57] = 0xFC;
        edid[59..68].copy_from_slice(b"DELL U240");
        edid[68] = 0x0A;
        // Serial descriptor in the second block.
        edid[72] = 0;
        edid[73] = 0;
        edid[75] = 0xFF;
        edid[77..83].copy_from_slice(b"SN1234");
        edid[83] = 0x0A;
        edid
    }

    #[test]
    fn parses_vendor_name_and_serial() {
        let edid = Edid::parse(&synthetic_edid()).unwrap();
        assert_eq!(edid.pnp_id.as_deref(), Some("DEL"));
        assert_eq!(edid.name.as_deref(), Some("DELL U240"));
        assert_eq!(edid.serial.as_deref(), Some("SN1234"));
    }

    #[test]
    fn short_blob_is_rejected() {
        assert!(Edid::parse(b"too short").is_none());
    }
}
