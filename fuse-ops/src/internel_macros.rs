/// Writes a formatted line to the debug sink of an [`Envelope`](crate::Envelope),
/// attributed to the line of the macro call
#[macro_export]
macro_rules! op_log {
    ($env:expr, $($arg:tt)+) => {
        $env.logf(::std::format_args!($($arg)+))
    };
}

macro_rules! declare_operations {
    ($($variant:ident($op:ident) = $opcode:ident,)+) => {
        /// An operation decoded from a kernel request, waiting for its response
        #[derive(Debug)]
        #[non_exhaustive]
        pub enum Operation {
            $(
                #[allow(missing_docs)]
                $variant(crate::envelope::Envelope<crate::ops::$op>),
            )+
        }

        impl Operation {
            /// Returns the request id assigned by the kernel
            #[must_use]
            pub fn unique(&self) -> u64 {
                match *self {
                    $(Self::$variant(ref env) => env.unique(),)+
                }
            }

            /// Describes the operation like `GetInodeAttributes(inode=42)`
            #[must_use]
            pub fn short_desc(&self) -> String {
                match *self {
                    $(Self::$variant(ref env) => env.short_desc(),)+
                }
            }

            /// Returns the context of the operation
            #[must_use]
            pub fn context(&self) -> &crate::context::Context {
                match *self {
                    $(Self::$variant(ref env) => env.context(),)+
                }
            }

            /// Responds without inspecting the variant
            /// # Errors
            /// Returns [`ReplyError`](crate::ReplyError) if the reply channel fails
            #[track_caller]
            pub fn respond(
                self,
                result: Result<(), crate::error::OpError>,
            ) -> Result<(), crate::error::ReplyError> {
                match self {
                    $(Self::$variant(env) => env.respond(result),)+
                }
            }
        }

        /// decodes the body of a known opcode, returns `None` for the others
        fn decode_operation(
            dispatcher: &Dispatcher,
            header: crate::request::RequestHeader,
            de: &mut crate::decode::Decoder<'_>,
        ) -> Result<Option<Operation>, crate::decode::DecodeError> {
            use crate::decode::Decode;

            let proto = dispatcher.session.proto();
            match header.opcode {
                $(
                    crate::kernel::fuse_opcode::$opcode => {
                        let op = crate::ops::$op::decode(&header, proto, de)?;
                        Ok(Some(Operation::$variant(dispatcher.wrap(op, header))))
                    }
                )+
                _ => Ok(None),
            }
        }
    };
}
