//! Configuration descriptor tree
//!
//! A GET_DESCRIPTOR(CONFIGURATION) response is a flat run of descriptors:
//! the configuration header followed by interface, endpoint and
//! class-specific descriptors in document order. [`DescriptorWalker`] splits
//! that run into typed tokens, and [`Configuration::parse`] folds the tokens
//! into the Configuration → Interface → AlternateSetting → Endpoint tree.

use crate::descriptor::{
    ConfigurationDescriptor, EndpointDescriptor, INTERFACE_DESC_LEN, InterfaceDescriptor,
    ENDPOINT_DESC_LEN,
};
use crate::error::{ProtocolError, Result};
use crate::types::{DESC_CONFIGURATION, DESC_ENDPOINT, DESC_INTERFACE};
use serde::{Deserialize, Serialize};

/// A descriptor the stack does not interpret (class or vendor specific)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraDescriptor {
    pub descriptor_type: u8,
    /// Raw bytes including the two-byte header
    pub data: Vec<u8>,
}

/// One descriptor out of a configuration blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorToken {
    Configuration(ConfigurationDescriptor),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    Other(ExtraDescriptor),
}

/// Iterator over the descriptors packed in a configuration blob
pub struct DescriptorWalker<'a> {
    bytes: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> DescriptorWalker<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            failed: false,
        }
    }

    fn next_token(&mut self) -> Result<DescriptorToken> {
        let rest = &self.bytes[self.offset..];
        if rest.len() < 2 {
            return Err(ProtocolError::Truncated {
                needed: 2,
                available: rest.len(),
            });
        }
        let length = rest[0] as usize;
        if length < 2 {
            return Err(ProtocolError::InvalidLength {
                length: rest[0],
                offset: self.offset,
            });
        }
        if rest.len() < length {
            return Err(ProtocolError::Truncated {
                needed: length,
                available: rest.len(),
            });
        }
        let raw = &rest[..length];
        let descriptor_type = raw[1];
        let min_len = match descriptor_type {
            DESC_INTERFACE => INTERFACE_DESC_LEN,
            DESC_ENDPOINT => ENDPOINT_DESC_LEN,
            _ => 2,
        };
        if length < min_len {
            return Err(ProtocolError::InvalidLength {
                length: rest[0],
                offset: self.offset,
            });
        }
        self.offset += length;

        Ok(match descriptor_type {
            DESC_CONFIGURATION => DescriptorToken::Configuration(ConfigurationDescriptor::parse(raw)?),
            DESC_INTERFACE => DescriptorToken::Interface(InterfaceDescriptor::parse(raw)?),
            DESC_ENDPOINT => DescriptorToken::Endpoint(EndpointDescriptor::parse(raw)?),
            _ => DescriptorToken::Other(ExtraDescriptor {
                descriptor_type,
                data: raw.to_vec(),
            }),
        })
    }
}

impl Iterator for DescriptorWalker<'_> {
    type Item = Result<DescriptorToken>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.bytes.len() {
            return None;
        }
        let token = self.next_token();
        if token.is_err() {
            self.failed = true;
        }
        Some(token)
    }
}

/// One alternate setting of an interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateSetting {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
    pub extra: Vec<ExtraDescriptor>,
}

impl AlternateSetting {
    pub fn setting(&self) -> u8 {
        self.descriptor.alternate_setting
    }
}

/// An interface and all of its alternate settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub number: u8,
    pub alternates: Vec<AlternateSetting>,
}

impl Interface {
    pub fn alternate(&self, setting: u8) -> Option<&AlternateSetting> {
        self.alternates.iter().find(|alt| alt.setting() == setting)
    }
}

/// A fully parsed configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub descriptor: ConfigurationDescriptor,
    pub interfaces: Vec<Interface>,
    /// Descriptors between the configuration header and the first interface
    pub extra: Vec<ExtraDescriptor>,
}

impl Configuration {
    /// Parse a complete configuration blob (wTotalLength bytes)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut walker = DescriptorWalker::new(bytes);
        let descriptor = match walker.next() {
            Some(Ok(DescriptorToken::Configuration(desc))) => desc,
            Some(Ok(_)) => {
                return Err(ProtocolError::UnexpectedType {
                    expected: DESC_CONFIGURATION,
                    found: bytes[1],
                });
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(ProtocolError::Truncated {
                    needed: 2,
                    available: 0,
                });
            }
        };

        let mut config = Configuration {
            descriptor,
            interfaces: Vec::new(),
            extra: Vec::new(),
        };

        // Interface and alternate index that trailing descriptors belong to
        let mut current: Option<(usize, usize)> = None;
        for token in walker {
            match token? {
                DescriptorToken::Interface(desc) => {
                    let alternate = AlternateSetting {
                        descriptor: desc.clone(),
                        endpoints: Vec::new(),
                        extra: Vec::new(),
                    };
                    let index = match config
                        .interfaces
                        .iter()
                        .position(|intf| intf.number == desc.number)
                    {
                        Some(index) => index,
                        None => {
                            config.interfaces.push(Interface {
                                number: desc.number,
                                alternates: Vec::new(),
                            });
                            config.interfaces.len() - 1
                        }
                    };
                    let alternates = &mut config.interfaces[index].alternates;
                    alternates.push(alternate);
                    current = Some((index, alternates.len() - 1));
                }
                DescriptorToken::Endpoint(ep) => {
                    let (intf, alt) = current.ok_or(ProtocolError::OrphanEndpoint)?;
                    config.interfaces[intf].alternates[alt].endpoints.push(ep);
                }
                DescriptorToken::Other(extra) => match current {
                    Some((intf, alt)) => config.interfaces[intf].alternates[alt].extra.push(extra),
                    None => config.extra.push(extra),
                },
                // A second header inside one blob is ignored
                DescriptorToken::Configuration(_) => {}
            }
        }

        Ok(config)
    }

    pub fn value(&self) -> u8 {
        self.descriptor.value
    }

    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|intf| intf.number == number)
    }

    /// Serialize the tree back into a configuration blob
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for extra in &self.extra {
            body.extend_from_slice(&extra.data);
        }
        for intf in &self.interfaces {
            for alt in &intf.alternates {
                alt.descriptor.encode(&mut body);
                for extra in &alt.extra {
                    body.extend_from_slice(&extra.data);
                }
                for ep in &alt.endpoints {
                    ep.encode(&mut body);
                }
            }
        }
        let mut header = self.descriptor.clone();
        header.total_length = (crate::descriptor::CONFIGURATION_DESC_LEN + body.len()) as u16;
        header.num_interfaces = self.interfaces.len() as u8;
        let mut buf = Vec::with_capacity(header.total_length as usize);
        header.encode(&mut buf);
        buf.extend_from_slice(&body);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Keyboard-like configuration: one interface, a HID descriptor and one
    /// interrupt IN endpoint, plus a second interface with two alternates.
    fn sample_blob() -> Vec<u8> {
        let mut blob = vec![
            9, 2, 0, 0, 2, 1, 0, 0xa0, 50, // configuration, total length patched below
            9, 4, 0, 0, 1, 3, 1, 1, 0, // interface 0 alt 0, HID
            9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0, // HID class descriptor
            7, 5, 0x81, 3, 8, 0, 10, // EP1 IN interrupt
            9, 4, 1, 0, 0, 0xff, 0, 0, 0, // interface 1 alt 0, no endpoints
            9, 4, 1, 1, 1, 0xff, 0, 0, 0, // interface 1 alt 1
            7, 5, 0x02, 2, 64, 0, 0, // EP2 OUT bulk
        ];
        let total = blob.len() as u16;
        blob[2..4].copy_from_slice(&total.to_le_bytes());
        blob
    }

    #[test]
    fn test_walker_tokens() {
        let blob = sample_blob();
        let tokens: Vec<_> = DescriptorWalker::new(&blob)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(tokens.len(), 7);
        assert!(matches!(tokens[0], DescriptorToken::Configuration(_)));
        assert!(matches!(tokens[1], DescriptorToken::Interface(_)));
        assert!(matches!(
            &tokens[2],
            DescriptorToken::Other(ExtraDescriptor {
                descriptor_type: 0x21,
                ..
            })
        ));
        assert!(matches!(tokens[3], DescriptorToken::Endpoint(_)));
    }

    #[test]
    fn test_configuration_tree() {
        let config = Configuration::parse(&sample_blob()).unwrap();
        assert_eq!(config.value(), 1);
        assert_eq!(config.interfaces.len(), 2);

        let hid = config.interface(0).unwrap();
        assert_eq!(hid.alternates.len(), 1);
        assert_eq!(hid.alternates[0].extra.len(), 1);
        assert_eq!(hid.alternates[0].endpoints[0].address, 0x81);

        let vendor = config.interface(1).unwrap();
        assert_eq!(vendor.alternates.len(), 2);
        assert!(vendor.alternate(0).unwrap().endpoints.is_empty());
        assert_eq!(vendor.alternate(1).unwrap().endpoints[0].address, 0x02);
    }

    #[test]
    fn test_tree_serializes_back() {
        let blob = sample_blob();
        let config = Configuration::parse(&blob).unwrap();
        assert_eq!(config.to_bytes(), blob);
    }

    #[test]
    fn test_zero_length_descriptor_is_rejected() {
        let mut blob = sample_blob();
        blob[9] = 0;
        assert_eq!(
            Configuration::parse(&blob),
            Err(ProtocolError::InvalidLength {
                length: 0,
                offset: 9
            })
        );
    }

    #[test]
    fn test_truncated_blob() {
        let blob = sample_blob();
        let err = Configuration::parse(&blob[..30]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn test_orphan_endpoint() {
        let blob = vec![9, 2, 16, 0, 0, 1, 0, 0x80, 50, 7, 5, 0x81, 3, 8, 0, 10];
        assert_eq!(
            Configuration::parse(&blob),
            Err(ProtocolError::OrphanEndpoint)
        );
    }
}
