//! Skater.NET string encryption.
//!
//! Encrypted strings are stored into static fields of the decrypter type by its
//! `.cctor` (`ldstr; stsfld; ldsfld; call decrypt; stsfld F`), and user code reads them
//! back with `ldsfld F`. Those loads become `ldstr` with the decrypted text.
//!
//! Two ciphers exist. V1 is TripleDES keyed through `PasswordDeriveBytes`. The salt and
//! password are hidden in code strings. V2 is a small integer transposition over space
//! separated triples.

use std::collections::BTreeMap;

use base64::Engine;
use regex::Regex;

use crate::{
    assembly::Instruction,
    deobfuscation::{
        codecs,
        context::Session,
        events::EventKind,
        fingerprint,
        rewriter::{apply_windows, collect_windows, CallSiteWindow},
    },
    file::parser::Parser,
    metadata::{module::Module, token::Token},
    utils::crypto::{self, PasswordDeriveBytes},
    Error, Result,
};

const V2_CALLS: [&str; 6] = [
    "System.String[] System.String::Split(System.Char[])",
    "System.Int32 System.Array::GetUpperBound(System.Int32)",
    "System.String Microsoft.VisualBasic.CompilerServices.Conversions::ToString(System.Char)",
    "System.Int32 Microsoft.VisualBasic.CompilerServices.Conversions::ToInteger(System.String)",
    "System.String System.String::Concat(System.String,System.String)",
    "System.Char Microsoft.VisualBasic.Strings::Chr(System.Int32)",
];

const PASSWORD_PIECE: &str = r"^[a-fA-F0-9]{2} $";

/// The string cipher a Skater.NET build uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkaterCipher {
    /// TripleDES with a derived key
    V1 {
        /// Two-key TripleDES key
        key: Vec<u8>,
        /// CBC IV
        iv: Vec<u8>,
    },
    /// Integer triples
    V2,
}

impl SkaterCipher {
    /// Decrypt one string.
    ///
    /// V1 input that is not valid base64 decrypts to the empty string.
    ///
    /// # Errors
    /// Returns [`crate::Error::Crypto`] for V1 cipher failures and
    /// [`crate::Error::Decode`] for malformed V2 input.
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        match self {
            SkaterCipher::V1 { key, iv } => {
                let Ok(data) = base64::engine::general_purpose::STANDARD.decode(encrypted) else {
                    return Ok(String::new());
                };
                let plain = crypto::tdes_cbc_decrypt(key, iv, &data)?;
                Parser::new(&plain).read_utf16_bytes(plain.len())
            }
            SkaterCipher::V2 => codecs::skater_v2_decode(encrypted),
        }
    }

    fn version(&self) -> &'static str {
        match self {
            SkaterCipher::V1 { .. } => "V1",
            SkaterCipher::V2 => "V2",
        }
    }
}

/// A detected Skater.NET string decrypter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkaterNet {
    /// Type holding the decrypter and the string fields
    pub decrypter_type: Token,
    /// `String(String)` decrypter
    pub decrypter: Token,
    /// The type's static constructor, which fills the string fields
    pub cctor: Token,
    /// Cipher recovered from the decrypter
    pub cipher: SkaterCipher,
    /// Decrypted field values, filled by [`SkaterNet::initialize`]
    pub strings: BTreeMap<Token, String>,
}

impl SkaterNet {
    /// Find the decrypter type and recover its cipher.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if the password pattern fails to compile.
    pub fn detect(module: &Module, _session: &Session) -> Result<Option<Self>> {
        let piece = Regex::new(PASSWORD_PIECE)
            .map_err(|_| Error::Error(format!("Could not parse regex '{PASSWORD_PIECE}'")))?;

        for ty in module.types() {
            let Some(def) = module.type_def(ty) else {
                continue;
            };
            if !def.properties.is_empty() || !def.events.is_empty() {
                continue;
            }
            let Some(cctor) = module.type_cctor(ty) else {
                continue;
            };

            for &method in &def.methods {
                let Some(m) = module.method(method) else {
                    continue;
                };
                if !m.is_static() || m.body.is_none() || !m.is_method("System.String", &["System.String"]) {
                    continue;
                }
                let cipher = v1_cipher(module, method, &piece).or_else(|| {
                    is_v2(module, method).then_some(SkaterCipher::V2)
                });
                if let Some(cipher) = cipher {
                    return Ok(Some(SkaterNet {
                        decrypter_type: ty,
                        decrypter: method,
                        cctor,
                        cipher,
                        strings: BTreeMap::new(),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// `"V1"` or `"V2"`.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        Some(self.cipher.version().to_string())
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(SkaterNet {
            decrypter_type: new.rebind_type(old, self.decrypter_type)?,
            decrypter: new.rebind_method(old, self.decrypter)?,
            cctor: new.rebind_method(old, self.cctor)?,
            cipher: self.cipher.clone(),
            strings: self
                .strings
                .iter()
                .map(|(&field, s)| Ok((new.rebind_field(old, field)?, s.clone())))
                .collect::<Result<_>>()?,
        })
    }

    /// Decrypt the strings the `.cctor` stores into the type's fields.
    ///
    /// # Errors
    /// Never fails; strings that do not decrypt are logged and skipped.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        let code = fingerprint::instructions(module, self.cctor);
        for window in code.windows(5) {
            let Some(encrypted) = module.ldstr_value(&window[0]) else {
                continue;
            };
            if !window[1].is(0x80) || !window[2].is(0x7E) || !window[3].is(0x28) || !window[4].is(0x80) {
                continue;
            }
            let Some(field) = window[4].token_operand() else {
                continue;
            };
            if module.field(field).map(|f| f.declaring_type) != Some(self.decrypter_type) {
                continue;
            }

            match self.cipher.decrypt(encrypted) {
                Ok(decrypted) => {
                    self.strings.insert(field, decrypted);
                }
                Err(error) => deob_warn!(
                    session.logger,
                    "Could not decrypt string field {}: {}",
                    field,
                    error
                ),
            }
        }
        Ok(())
    }

    /// Replace loads of the decrypted fields with string literals. Returns the number of
    /// loads replaced.
    ///
    /// # Errors
    /// Propagates rewriting errors.
    pub fn apply(&self, module: &mut Module, session: &Session) -> Result<usize> {
        if !session.config.decrypt_strings || self.strings.is_empty() {
            return Ok(0);
        }
        let reporter = session.reporter();

        let mut total = 0;
        for method in module.methods() {
            let windows = collect_windows(module, method, |block, i| {
                let field = block[i].token_operand().filter(|_| block[i].is(0x7E))?;
                let decrypted = self.strings.get(&field)?;
                Some(CallSiteWindow::new(i, 1, vec![Instruction::ldstr(decrypted.clone())]))
            });
            for window in &windows {
                if let Some(s) = window.replacement.first().and_then(Instruction::string_operand) {
                    deob_verbose!(reporter.logger, "Decrypted string: {:?}", s);
                }
                reporter.record(EventKind::StringDecrypted).at(method, window.start);
            }
            total += apply_windows(module, method, windows)?;
        }
        Ok(total)
    }

    /// Returns true if no method outside the decrypter type calls into it.
    #[must_use]
    pub fn can_remove_type(&self, module: &Module) -> bool {
        module.methods().into_iter().all(|method| {
            if module.method(method).map(|m| m.declaring_type) == Some(self.decrypter_type) {
                return true;
            }
            !fingerprint::instructions(module, method).iter().any(|instr| {
                instr.is_call()
                    && instr
                        .token_operand()
                        .and_then(|t| module.method(t))
                        .is_some_and(|m| m.declaring_type == self.decrypter_type)
            })
        })
    }
}

fn v1_cipher(module: &Module, method: Token, piece: &Regex) -> Option<SkaterCipher> {
    let salt = fingerprint::code_strings(module, method)
        .iter()
        .find_map(|s| fix_salt(s))?;
    let password = password(module, method, piece)?;

    let mut pdb = PasswordDeriveBytes::new(password.as_bytes(), &salt, 100);
    let key = pdb.get_bytes(16).ok()?;
    let iv = pdb.get_bytes(8).ok()?;
    Some(SkaterCipher::V1 { key, iv })
}

fn is_v2(module: &Module, method: Token) -> bool {
    fingerprint::has_int(module, method, i32::from(b' '))
        && V2_CALLS
            .iter()
            .all(|name| fingerprint::calls_method(module, method, name))
}

/// Reverse, decrement each character, then parse hex pairs.
fn fix_salt(s: &str) -> Option<Vec<u8>> {
    let chars: Vec<char> = s.chars().collect();
    if !(10..=30).contains(&chars.len()) || chars.len() % 2 != 0 {
        return None;
    }
    let fixed: Vec<char> = chars
        .iter()
        .rev()
        .map(|&c| char::from_u32(u32::from(c).wrapping_sub(1)))
        .collect::<Option<_>>()?;
    fixed
        .chunks(2)
        .map(|pair| {
            let hex: String = pair.iter().collect();
            u8::from_str_radix(&hex, 16).ok()
        })
        .collect()
}

fn password(module: &Module, decrypter: Token, piece: &Regex) -> Option<String> {
    let owner = module.method(decrypter)?.declaring_type;
    fingerprint::called_methods(module, decrypter)
        .into_iter()
        .filter(|&m| {
            module.method(m).is_some_and(|def| {
                def.is_static()
                    && def.body.is_some()
                    && def.declaring_type == owner
                    && def.is_method("System.String", &[])
            })
        })
        .find_map(|m| {
            let hex = password_pieces(module, m, piece)?;
            fix_password(&hex).filter(|p| !p.is_empty())
        })
}

fn password_pieces(module: &Module, method: Token, piece: &Regex) -> Option<String> {
    let mut hex = String::new();
    for callee in fingerprint::called_methods(module, method) {
        let strings = fingerprint::code_strings(module, callee);
        match strings.as_slice() {
            [s] if piece.is_match(s) => hex.push_str(s),
            _ => return None,
        }
    }
    (!hex.is_empty()).then_some(hex)
}

fn fix_password(hex: &str) -> Option<String> {
    hex.trim()
        .split(' ')
        .map(|part| {
            u32::from_str_radix(part, 16)
                .ok()
                .and_then(char::from_u32)
        })
        .collect()
}
