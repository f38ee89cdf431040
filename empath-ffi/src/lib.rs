#![feature(bstr, slice_pattern, result_option_map_or_default)]

use core::slice::SlicePattern;
use std::{borrow::Cow, ffi::CStr};

use empath_common::{address::Address, context::Context, status::Status};

pub mod modules;
pub mod string;

pub type InitFunc = unsafe fn() -> isize;
pub type ValidateData = unsafe fn(&Context) -> isize;

/// Retrieve the id associated with this context
///
/// This is the only way to retrieve the id for the context in an
/// ffi-compatible way. Any other way should be retrieved by
/// accessing the id member directly.
///
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_context_get_id(validate_context: &Context) -> crate::string::String {
    validate_context.id().into()
}

#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_context_get_recipients(
    validate_context: &Context,
) -> crate::string::StringVector {
    validate_context.recipients().into()
}

#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_context_get_sender(validate_context: &Context) -> crate::string::String {
    validate_context.sender().into()
}

///
/// Set the sender for the message. A special value of NULL will set the
/// sender to the NULL Sender.
///
/// # Safety
///
/// This should be able to be passed any valid pointer, and a valid `validate_context`, to
/// set the sender
///
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub unsafe extern "C" fn em_context_set_sender(
    validate_context: &mut Context,
    sender: *const libc::c_char,
) -> bool {
    if sender.is_null() {
        *validate_context.envelope.sender_mut() = None;
        return true;
    }

    let sender = unsafe { CStr::from_ptr(sender) };

    match sender.to_str() {
        Ok(sender) => match empath_common::address_parser::parse_forward_path(sender) {
            Ok(mailbox) => {
                *validate_context.envelope.sender_mut() = Some(Address::from(mailbox));
                true
            }
            Err(_err) => false,
        },
        Err(_err) => false,
    }
}

#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_context_get_data(validate_context: &Context) -> crate::string::String {
    validate_context
        .data
        .as_ref()
        .map_or_else(Default::default, |data| {
            crate::string::String::try_from(data.as_slice()).unwrap_or_default()
        })
}

///
/// # Safety
///
/// Even if provided with a null pointer, that would simply set the response to `None`
///
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub unsafe extern "C" fn em_context_set_response(
    validate_context: &mut Context,
    status: u32,
    response: *const libc::c_char,
) -> bool {
    validate_context.response = if response.is_null() {
        None
    } else {
        Some((Status::from(status), unsafe {
            Cow::Owned(
                CStr::from_ptr(response)
                    .to_owned()
                    .to_string_lossy()
                    .to_string(),
            )
        }))
    };

    true
}

#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_context_is_tls(validate_context: &Context) -> bool {
    validate_context.metadata.contains_key("tls")
}

#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_context_tls_protocol(validate_context: &Context) -> crate::string::String {
    validate_context
        .metadata
        .get("protocol")
        .map_or_default(crate::string::String::from)
}

#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_context_tls_cipher(validate_context: &Context) -> crate::string::String {
    validate_context
        .metadata
        .get("cipher")
        .map_or_default(crate::string::String::from)
}

///
/// # Safety
///
/// Provided with a null pointer, simply return false
///
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub unsafe extern "C" fn em_context_exists(
    validate_context: &Context,
    key: *const libc::c_char,
) -> bool {
    if key.is_null() {
        false
    } else {
        unsafe {
            CStr::from_ptr(key)
                .to_str()
                .is_ok_and(|key| validate_context.metadata.contains_key(key))
        }
    }
}

///
/// # Safety
///
/// Provided with a null pointer, simply return false
///
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub unsafe extern "C" fn em_context_set(
    validate_context: &mut Context,
    key: *const libc::c_char,
    value: *const libc::c_char,
) -> bool {
    if key.is_null() || value.is_null() {
        false
    } else {
        unsafe {
            CStr::from_ptr(key).to_str().is_ok_and(|key| {
                let value = CStr::from_ptr(value).to_str().map_or_default(String::from);
                *validate_context
                    .metadata
                    .entry(Cow::Owned(key.to_string()))
                    .or_default() = value;
                true
            })
        }
    }
}

///
/// # Safety
///
/// Provided with a null pointer, simply return a default value
///
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub unsafe extern "C" fn em_context_get(
    validate_context: &Context,
    key: *const libc::c_char,
) -> crate::string::String {
    if key.is_null() {
        crate::string::String::default()
    } else {
        unsafe {
            CStr::from_ptr(key)
                .to_str()
                .ok()
                .and_then(|key| validate_context.metadata.get(key))
                .map_or_else(crate::string::String::default, std::convert::Into::into)
        }
    }
}

// ============================================================================
// Delivery Context Accessors
// ============================================================================

/// Check if delivery context is present
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub const extern "C" fn em_context_has_delivery(validate_context: &Context) -> bool {
    validate_context.delivery.is_some()
}

/// Get the message ID from delivery context
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_delivery_get_message_id(validate_context: &Context) -> crate::string::String {
    validate_context
        .delivery
        .as_ref()
        .map_or_else(crate::string::String::default, |d| {
            d.message_id.as_str().into()
        })
}

/// Get the delivery domain from delivery context
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_delivery_get_domain(validate_context: &Context) -> crate::string::String {
    validate_context
        .delivery
        .as_ref()
        .map_or_else(crate::string::String::default, |d| d.domain.as_ref().into())
}

/// Get the delivery server from delivery context
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_delivery_get_server(validate_context: &Context) -> crate::string::String {
    validate_context
        .delivery
        .as_ref()
        .map_or_else(crate::string::String::default, |d| {
            d.server
                .as_ref()
                .map_or_else(crate::string::String::default, |s| s.as_str().into())
        })
}

/// Get the delivery error from delivery context
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_delivery_get_error(validate_context: &Context) -> crate::string::String {
    validate_context
        .delivery
        .as_ref()
        .map_or_else(crate::string::String::default, |d| {
            d.error
                .as_ref()
                .map_or_else(crate::string::String::default, |e| e.as_str().into())
        })
}

/// Get the delivery attempt count from delivery context
/// Returns 0 if no delivery context or no attempt count is set
#[unsafe(no_mangle)]
#[allow(clippy::module_name_repetitions)]
pub extern "C" fn em_delivery_get_attempts(validate_context: &Context) -> u32 {
    validate_context
        .delivery
        .as_ref()
        .and_then(|d| d.attempts)
        .unwrap_or(0)
}
