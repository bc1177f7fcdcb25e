//! The AES decrypt method shared by the .NET Reactor v3 protections.

use crate::{
    deobfuscation::{
        fingerprint::{self, TypeList},
        payload::{self, PayloadSource},
        rewriter::is_initialize_array_call,
    },
    metadata::{module::Module, token::Token},
    utils::crypto,
    Result,
};

const LOCALS: TypeList<'static> = TypeList::all(&[
    "System.Byte[]",
    "System.IO.MemoryStream",
    "System.Security.Cryptography.CryptoStream",
    "System.Security.Cryptography.ICryptoTransform",
]);
const CIPHERS: TypeList<'static> = TypeList::any(&[
    "System.Security.Cryptography.RijndaelManaged",
    "System.Security.Cryptography.AesManaged",
]);

/// A decrypt method and the key material initialized inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorDecrypter {
    /// The decrypt method
    pub method: Token,
    /// 32-byte AES key
    pub key: Vec<u8>,
    /// 16-byte IV
    pub iv: Vec<u8>,
}

impl ReactorDecrypter {
    /// Returns true if the locals of `method` look like a `CryptoStream` decryption
    /// through `RijndaelManaged` or `AesManaged`, with `extra_locals` also present.
    #[must_use]
    pub fn could_be_decrypt_method(module: &Module, method: Token, extra_locals: &[&str]) -> bool {
        if module.method(method).map_or(true, |m| m.body.is_none()) {
            return false;
        }
        let locals = fingerprint::local_types(module, method);
        LOCALS.matches(locals) && TypeList::all(extra_locals).matches(locals) && CIPHERS.matches(locals)
    }

    /// Read the key and IV arrays initialized in `method`.
    #[must_use]
    pub fn from_method(module: &Module, method: Token) -> Option<Self> {
        Some(ReactorDecrypter {
            method,
            key: initialized_byte_array(module, method, 32)?,
            iv: initialized_byte_array(module, method, 16)?,
        })
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if the method no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(ReactorDecrypter {
            method: new.rebind_method(old, self.method)?,
            key: self.key.clone(),
            iv: self.iv.clone(),
        })
    }

    /// AES-256-CBC with PKCS#7 padding.
    ///
    /// # Errors
    /// Returns [`crate::Error::Crypto`] for bad padding.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        crypto::aes_cbc_decrypt(&self.key, &self.iv, data)
    }
}

/// Data of the first `ldc.i4 size; newarr System.Byte; dup; ldtoken F; call
/// InitializeArray` in `method` whose field holds exactly `size` bytes.
fn initialized_byte_array(module: &Module, method: Token, size: usize) -> Option<Vec<u8>> {
    let count = i32::try_from(size).ok()?;
    fingerprint::instructions(module, method).windows(5).find_map(|w| {
        if w[0].ldc_i4_value() != Some(count)
            || !w[1].is(0x8D)
            || w[1].token_operand().and_then(|t| module.type_name(t)).as_deref() != Some("System.Byte")
            || !w[2].is(0x25)
            || !w[3].is(0xD0)
            || !is_initialize_array_call(module, &w[4])
        {
            return None;
        }
        let source = PayloadSource::RvaField(w[3].token_operand()?);
        let data = payload::locate(module, &[source]).ok()?.data;
        (data.len() == size).then_some(data)
    })
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use crate::{
        assembly::{Instruction, Operand},
        deobfuscation::rewriter::initialized_array,
        file::pe::{PeImage, SectionHeader},
        metadata::{
            builder::BodyBuilder,
            field::FieldDef,
            method::{MethodDef, MethodSig},
            typesystem::TypeDef,
        },
    };

    pub(crate) fn decrypt_method(module: &mut Module, ty: Token, key: &[u8], iv: &[u8]) -> Token {
        let arrays = [key, iv]
            .map(|data| initialized_array(module, "System.Byte", data.to_vec()).unwrap());
        decrypt_method_from(module, ty, arrays)
    }

    fn decrypt_method_from(module: &mut Module, ty: Token, arrays: [Vec<Instruction>; 2]) -> Token {
        let mut builder = BodyBuilder::new();
        builder.locals(&[
            "System.Byte[]",
            "System.IO.MemoryStream",
            "System.Security.Cryptography.RijndaelManaged",
            "System.Security.Cryptography.CryptoStream",
            "System.Security.Cryptography.ICryptoTransform",
        ]);
        for code in arrays {
            for instruction in code {
                builder.push(instruction);
            }
            builder.op("pop");
        }
        builder.op("ldnull").ret();
        module
            .add_method(
                ty,
                MethodDef::new("Decrypt", MethodSig::new("System.Byte[]", &["System.Byte[]"]))
                    .with_body(builder.build().unwrap()),
            )
            .unwrap()
    }

    #[test]
    fn key_and_iv_from_arrays() {
        let mut module = Module::new("a.exe");
        let ty = module.add_type(TypeDef::new("", "R"));
        let key: Vec<u8> = (0..32).collect();
        let iv = [7u8; 16];
        let method = decrypt_method(&mut module, ty, &key, &iv);

        assert!(ReactorDecrypter::could_be_decrypt_method(&module, method, &[]));
        assert!(!ReactorDecrypter::could_be_decrypt_method(&module, method, &["System.IO.Stream"]));
        let found = ReactorDecrypter::from_method(&module, method).unwrap();
        assert_eq!(found.key, key);
        assert_eq!(found.iv, iv);

        let encrypted = crypto::aes_cbc_encrypt(&key, &iv, b"native payload").unwrap();
        assert_eq!(found.decrypt(&encrypted).unwrap(), b"native payload");
    }

    #[test]
    fn key_and_iv_read_from_image() {
        let mut module = Module::new("a.exe");
        let key: Vec<u8> = (100..132).collect();
        let iv = [9u8; 16];
        let mut image = vec![0u8; 0x30];
        image[..0x20].copy_from_slice(&key);
        image[0x20..].copy_from_slice(&iv);
        module.pe = Some(PeImage::new(
            image,
            vec![SectionHeader {
                name: ".text".to_string(),
                virtual_address: 0x4000,
                virtual_size: 0x30,
                pointer_to_raw_data: 0,
                size_of_raw_data: 0x30,
            }],
            None,
        ));
        let ty = module.add_type(TypeDef::new("", "R"));
        let mut arrays = Vec::new();
        for (name, rva, size) in [("k", 0x4000, 32u32), ("v", 0x4020, 16)] {
            let field = module
                .add_field(ty, FieldDef::new(name, "R/Blob").with_image_rva(rva, size))
                .unwrap();
            let mut code =
                initialized_array(&mut module, "System.Byte", vec![0; size as usize]).unwrap();
            code[3] = Instruction::by_mnemonic("ldtoken", Operand::Token(field)).unwrap();
            arrays.push(code);
        }
        let [key_code, iv_code]: [Vec<Instruction>; 2] = arrays.try_into().unwrap();
        let method = decrypt_method_from(&mut module, ty, [key_code, iv_code]);

        let found = ReactorDecrypter::from_method(&module, method).unwrap();
        assert_eq!(found.key, key);
        assert_eq!(found.iv, iv);
    }

    #[test]
    fn missing_iv() {
        let mut module = Module::new("a.exe");
        let ty = module.add_type(TypeDef::new("", "R"));
        let method = decrypt_method(&mut module, ty, &[1; 32], &[2; 8]);
        assert!(ReactorDecrypter::from_method(&module, method).is_none());
    }
}
